//! Worker runtime: a supervised pool of execution slots.
//!
//! Each slot pulls one delivery, claims it through the recorder, keeps the
//! bus lease alive from a background renewer (which doubles as the
//! cancellation observer), runs the kind handler under the job's deadline,
//! streams artifacts into the blob store, and settles the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Result as AnyResult};
use bytes::Bytes;
use chrono::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::{BlobPath, BlobStore};
use crate::bus::{Delivery, DispatchQueue, MessageBus};
use crate::common::error::{Error, Result};
use crate::common::{ArtifactId, JobKind};
use crate::domains::artifacts::Artifact;
use crate::domains::executions::{Execution, Outcome, Recorder};
use crate::domains::jobs::{Job, JobStatus};
use crate::kernel::{ArtifactPayload, Clock, CollabContext, OutcomeHint, Service};

use super::handlers::Handler;

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Requested slot count; the effective count is capped by the budget.
    pub slots: usize,
    /// Declared per-slot resource needs and the local budget.
    pub slot_cpu_millis: u32,
    pub slot_memory_mb: u32,
    pub budget_cpu_millis: u32,
    pub budget_memory_mb: u32,
    pub ack_deadline: Duration,
    pub poll_interval: StdDuration,
    /// Grace for in-flight work during shutdown before it is nacked.
    pub drain_grace: StdDuration,
    /// How long a cancelled execution may keep running before force-abort.
    pub cancel_grace: StdDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            slots: 4,
            slot_cpu_millis: 500,
            slot_memory_mb: 256,
            budget_cpu_millis: 4_000,
            budget_memory_mb: 2_048,
            ack_deadline: Duration::seconds(30),
            poll_interval: StdDuration::from_millis(500),
            drain_grace: StdDuration::from_secs(60),
            cancel_grace: StdDuration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Slots the local budget actually permits.
    pub fn effective_slots(&self) -> usize {
        let by_cpu = (self.budget_cpu_millis / self.slot_cpu_millis.max(1)) as usize;
        let by_memory = (self.budget_memory_mb / self.slot_memory_mb.max(1)) as usize;
        self.slots.min(by_cpu).min(by_memory)
    }
}

struct WorkerShared {
    store: Arc<dyn crate::store::MetadataStore>,
    bus: Arc<dyn MessageBus>,
    blobs: Arc<dyn BlobStore>,
    recorder: Arc<Recorder>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<JobKind, Arc<dyn Handler>>,
    config: WorkerConfig,
}

pub struct WorkerRuntime {
    shared: Arc<WorkerShared>,
}

impl WorkerRuntime {
    pub fn new(
        store: Arc<dyn crate::store::MetadataStore>,
        bus: Arc<dyn MessageBus>,
        blobs: Arc<dyn BlobStore>,
        recorder: Arc<Recorder>,
        clock: Arc<dyn Clock>,
        handlers: HashMap<JobKind, Arc<dyn Handler>>,
        config: WorkerConfig,
    ) -> AnyResult<Self> {
        let effective = config.effective_slots();
        if effective == 0 {
            bail!(
                "worker budget ({}m cpu, {}MB) cannot fit a single slot ({}m cpu, {}MB)",
                config.budget_cpu_millis,
                config.budget_memory_mb,
                config.slot_cpu_millis,
                config.slot_memory_mb
            );
        }
        if effective < config.slots {
            warn!(
                requested = config.slots,
                effective, "slot count reduced to fit local resource budget"
            );
        }
        Ok(Self {
            shared: Arc::new(WorkerShared {
                store,
                bus,
                blobs,
                recorder,
                clock,
                handlers,
                config,
            }),
        })
    }
}

enum Verdict {
    Finished(Result<crate::kernel::CollaboratorOutput>),
    TimedOut,
    /// The cancellation token fired because the job was cancelled.
    Cancelled,
    /// The cancellation token fired during shutdown force-abort.
    Shutdown,
}

impl WorkerShared {
    fn queue(&self, kind: JobKind) -> Arc<dyn DispatchQueue> {
        self.bus.queue(kind)
    }

    async fn process_delivery(&self, kind: JobKind, delivery: Delivery, slot_cancel: CancellationToken) {
        let queue = self.queue(kind);
        let job_id = delivery.request.job_id;

        let job = match Job::find(&self.store, job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "delivery references missing job, dropping");
                let _ = queue.ack(&delivery.lease).await;
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "job load failed, returning delivery");
                let _ = queue
                    .nack(&delivery.lease, Duration::seconds(1))
                    .await;
                return;
            }
        };

        if job.status.is_terminal() {
            // Cancelled (or otherwise settled) while queued.
            debug!(job_id = %job_id, status = job.status.as_str(), "dropping delivery for settled job");
            let _ = self.recorder.cancel_pending(job_id).await;
            let _ = queue.ack(&delivery.lease).await;
            return;
        }

        let execution = match self.recorder.begin(&job, &self.config.worker_id).await {
            Ok(execution) => execution,
            Err(Error::Conflict(msg)) => {
                // Won-by-first: someone else is already running this one.
                debug!(job_id = %job_id, reason = %msg, "begin lost the claim, requeueing");
                let _ = queue.nack(&delivery.lease, Duration::seconds(5)).await;
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "recorder begin failed");
                let _ = queue.nack(&delivery.lease, Duration::seconds(1)).await;
                return;
            }
        };

        info!(
            job_id = %job_id,
            execution_id = %execution.id,
            attempt = execution.attempt_number,
            worker_id = %self.config.worker_id,
            "execution started"
        );

        // Lease renewer doubling as the cancellation observer.
        let cancel = slot_cancel.child_token();
        let renewer_stop = CancellationToken::new();
        let renewer = {
            let queue = queue.clone();
            let store = self.store.clone();
            let lease = delivery.lease;
            let ack_deadline = self.config.ack_deadline;
            let cancel = cancel.clone();
            let stop = renewer_stop.clone();
            let renew_every = StdDuration::from_millis((ack_deadline.num_milliseconds() / 3).max(10) as u64);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(renew_every);
                interval.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            if cancel.is_cancelled() {
                                // Cancellation observed: stop extending so
                                // the lease lapses if the slot hangs.
                                break;
                            }
                            if let Err(e) = queue.extend(&lease, ack_deadline).await {
                                warn!(error = %e, "lease extension failed");
                                break;
                            }
                            match Job::find(&store, job_id).await {
                                Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                                    cancel.cancel();
                                }
                                _ => {}
                            }
                        }
                    }
                }
            })
        };

        let timeout = effective_timeout(&job);
        let ctx = CollabContext::new(cancel.clone(), timeout);
        let Some(handler) = self.handlers.get(&kind).cloned() else {
            error!(queue = %kind, "no handler registered for kind");
            renewer_stop.cancel();
            let _ = renewer.await;
            let _ = self
                .recorder
                .finish(
                    execution.id,
                    Outcome::TerminalFailure,
                    Some(("no_handler".into(), format!("no handler for kind {kind}"))),
                )
                .await;
            let _ = queue.ack(&delivery.lease).await;
            return;
        };

        let mut work = Box::pin(async move { handler.run(&job, &ctx).await });
        let verdict = tokio::select! {
            result = &mut work => Verdict::Finished(result),
            _ = tokio::time::sleep(timeout) => Verdict::TimedOut,
            _ = cancel.cancelled() => {
                // Advisory cancellation: the handler gets a bounded grace
                // to come back on its own, then the slot force-aborts.
                let _ = tokio::time::timeout(self.config.cancel_grace, &mut work).await;
                match Job::find(&self.store, job_id).await {
                    Ok(Some(job)) if job.status == JobStatus::Cancelled => Verdict::Cancelled,
                    _ => Verdict::Shutdown,
                }
            }
        };
        drop(work);

        renewer_stop.cancel();
        let _ = renewer.await;

        self.settle(&queue, &delivery, &execution, verdict).await;
    }

    async fn settle(
        &self,
        queue: &Arc<dyn DispatchQueue>,
        delivery: &Delivery,
        execution: &Execution,
        verdict: Verdict,
    ) {
        let job_id = execution.job_id;
        match verdict {
            Verdict::Finished(Ok(output)) => match output.outcome {
                OutcomeHint::Ok => {
                    match self
                        .persist_artifacts(delivery.request.kind, execution, output.artifacts)
                        .await
                    {
                        Ok(count) => {
                            if let Err(e) =
                                self.recorder.finish(execution.id, Outcome::Success, None).await
                            {
                                error!(execution_id = %execution.id, error = %e, "success finish failed");
                                let _ = queue.nack(&delivery.lease, Duration::seconds(1)).await;
                                return;
                            }
                            self.settle_job_status(job_id, JobStatus::Completed).await;
                            let _ = queue.ack(&delivery.lease).await;
                            info!(
                                execution_id = %execution.id,
                                artifacts = count,
                                "execution succeeded"
                            );
                        }
                        Err(e) => {
                            warn!(execution_id = %execution.id, error = %e, "artifact persistence failed");
                            self.fail_retryable(queue, delivery, execution, "artifact_store", &e.to_string())
                                .await;
                        }
                    }
                }
                OutcomeHint::Retryable(msg) => {
                    self.fail_retryable(queue, delivery, execution, "retryable", &msg).await;
                }
                OutcomeHint::Terminal(msg) => {
                    warn!(execution_id = %execution.id, error = %msg, "execution failed terminally");
                    if let Err(e) = self
                        .recorder
                        .finish(
                            execution.id,
                            Outcome::TerminalFailure,
                            Some(("terminal".into(), msg)),
                        )
                        .await
                    {
                        error!(execution_id = %execution.id, error = %e, "terminal finish failed");
                    }
                    self.settle_job_status(job_id, JobStatus::Failed).await;
                    let _ = queue.ack(&delivery.lease).await;
                }
            },
            Verdict::Finished(Err(e)) => {
                self.fail_retryable(queue, delivery, execution, "internal", &e.to_string())
                    .await;
            }
            Verdict::TimedOut => {
                self.fail_retryable(queue, delivery, execution, "timeout", "execution deadline exceeded")
                    .await;
            }
            Verdict::Cancelled => {
                info!(execution_id = %execution.id, "execution cancelled");
                if let Err(e) = self
                    .recorder
                    .finish(
                        execution.id,
                        Outcome::Cancelled,
                        Some(("cancelled".into(), "job cancelled while running".into())),
                    )
                    .await
                {
                    error!(execution_id = %execution.id, error = %e, "cancel finish failed");
                }
                // Retries are suppressed: the message is consumed.
                let _ = queue.ack(&delivery.lease).await;
            }
            Verdict::Shutdown => {
                info!(execution_id = %execution.id, "returning execution during shutdown");
                if let Err(e) = self
                    .recorder
                    .finish(
                        execution.id,
                        Outcome::RetryableFailure,
                        Some(("shutdown".into(), "worker shut down mid-execution".into())),
                    )
                    .await
                {
                    error!(execution_id = %execution.id, error = %e, "shutdown finish failed");
                }
                let _ = queue.nack(&delivery.lease, Duration::seconds(1)).await;
            }
        }
    }

    /// Record a retryable failure and hand the message back with the
    /// policy's backoff. Exhausted messages are routed to the DLQ by the
    /// queue, where the observer records the dead-letter transition.
    async fn fail_retryable(
        &self,
        queue: &Arc<dyn DispatchQueue>,
        delivery: &Delivery,
        execution: &Execution,
        kind: &str,
        message: &str,
    ) {
        warn!(
            execution_id = %execution.id,
            attempt = delivery.delivery_attempt,
            error_kind = kind,
            error = %message,
            "execution failed, may retry"
        );
        if let Err(e) = self
            .recorder
            .finish(
                execution.id,
                Outcome::RetryableFailure,
                Some((kind.to_string(), message.to_string())),
            )
            .await
        {
            error!(execution_id = %execution.id, error = %e, "retryable finish failed");
        }
        let delay = delivery
            .request
            .retry
            .backoff_for_attempt(delivery.delivery_attempt);
        let _ = queue.nack(&delivery.lease, delay).await;
    }

    /// Upload payloads chunk by chunk and attach the records; all of it
    /// happens before the execution is allowed to reach `succeeded`.
    async fn persist_artifacts(
        &self,
        kind: JobKind,
        execution: &Execution,
        payloads: Vec<ArtifactPayload>,
    ) -> Result<usize> {
        let count = payloads.len();
        for payload in payloads {
            let artifact_id = ArtifactId::new();
            let now = self.clock.now();
            let path = BlobPath {
                tenant_id: execution.tenant_id,
                kind,
                artifact_id,
                date: now,
            };

            let handle = self.blobs.start_upload(&path).await?;
            for chunk in payload.data.chunks(UPLOAD_CHUNK_BYTES) {
                self.blobs
                    .write_chunk(&handle, Bytes::copy_from_slice(chunk))
                    .await?;
            }
            let finished = self.blobs.finish_upload(handle).await?;

            self.recorder
                .attach_artifact(Artifact {
                    id: artifact_id,
                    execution_id: execution.id,
                    tenant_id: execution.tenant_id,
                    storage_uri: finished.uri,
                    content_type: payload.content_type,
                    size_bytes: finished.size_bytes,
                    sha256: finished.sha256,
                    metadata: payload.metadata,
                    created_at: now,
                })
                .await?;
        }
        Ok(count)
    }

    /// One-shot jobs settle with their final execution; recurring jobs stay
    /// active for the next firing.
    async fn settle_job_status(&self, job_id: crate::common::JobId, to: JobStatus) {
        let result = async {
            let job = Job::require(&self.store, job_id).await?;
            if job.schedule.is_recurring() {
                return Ok(None);
            }
            Job::transition_status(&self.store, job_id, &[JobStatus::Active], to, self.clock.now())
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(job_id = %job_id, error = %e, "job status settlement failed");
        }
    }
}

/// The execution deadline: the job's own timeout capped by the kind ceiling.
fn effective_timeout(job: &Job) -> StdDuration {
    let ceiling = job.kind.timeout_ceiling().num_milliseconds();
    let timeout_ms = job.timeout_ms.clamp(1, ceiling);
    StdDuration::from_millis(timeout_ms as u64)
}

#[async_trait::async_trait]
impl Service for WorkerRuntime {
    fn name(&self) -> &'static str {
        "worker-runtime"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> AnyResult<()> {
        let shared = self.shared;
        let slots = shared.config.effective_slots();
        let semaphore = Arc::new(Semaphore::new(slots));
        let slot_cancel = CancellationToken::new();
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(
            worker_id = %shared.config.worker_id,
            slots,
            "worker runtime starting"
        );

        while !shutdown.is_cancelled() {
            while tasks.try_join_next().is_some() {}

            let free = semaphore.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.poll_interval) => continue,
                }
            }

            let mut delivered = 0usize;
            for kind in JobKind::ALL {
                let free_now = semaphore.available_permits();
                if free_now == 0 {
                    break;
                }
                let deliveries = match shared
                    .queue(kind)
                    .pull(&shared.config.worker_id, free_now, shared.config.ack_deadline)
                    .await
                {
                    Ok(deliveries) => deliveries,
                    Err(e) => {
                        warn!(queue = %kind, error = %e, "pull failed");
                        continue;
                    }
                };

                for delivery in deliveries {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        // No slot after all; hand the message straight back.
                        let _ = shared
                            .queue(kind)
                            .nack(&delivery.lease, Duration::seconds(0))
                            .await;
                        continue;
                    };
                    delivered += 1;
                    let shared = shared.clone();
                    let slot_cancel = slot_cancel.clone();
                    tasks.spawn(async move {
                        shared.process_delivery(kind, delivery, slot_cancel).await;
                        drop(permit);
                    });
                }
            }

            if delivered == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                }
            }
        }

        // Graceful drain: stop pulling, let in-flight work finish within the
        // grace period, then force-abort so remaining messages redeliver.
        let in_flight = slots - semaphore.available_permits();
        if in_flight > 0 {
            info!(in_flight, "draining in-flight executions");
        }
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        tokio::pin!(drain);
        if tokio::time::timeout(shared.config.drain_grace, &mut drain)
            .await
            .is_err()
        {
            warn!("drain grace expired, force-aborting remaining slots");
            slot_cancel.cancel();
            let _ = tokio::time::timeout(
                shared.config.cancel_grace + StdDuration::from_secs(5),
                &mut drain,
            )
            .await;
        }

        info!(worker_id = %shared.config.worker_id, "worker runtime stopped");
        Ok(())
    }
}
