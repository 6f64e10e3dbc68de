//! The scheduler: turns due jobs into queue messages.
//!
//! One replica is active at a time (leader lease); followers keep warm and
//! take over within a lease TTL. Dispatch is single-flight per job: the
//! CAS claim on the job's `next_fire_at` arbitrates between the intake
//! event path, the tick scan, and the recovery sweep.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result as AnyResult;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{ExecutionRequest, MessageBus};
use crate::common::error::Result;
use crate::common::JobId;
use crate::domains::executions::{Outcome, Recorder};
use crate::domains::jobs::{next_cron_occurrence, Job, JobStatus, Schedule};
use crate::kernel::{Clock, Service};
use crate::store::{self, collections, MetadataStore, Query};

use super::lease::LeaderLease;

/// Events pushed from intake into the scheduler's mailbox.
#[derive(Debug, Clone, Copy)]
pub enum SchedulerEvent {
    JobSubmitted(JobId),
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub tick: StdDuration,
    /// A cron firing older than this at dispatch time counts as missed.
    pub misfire_grace: Duration,
    /// How often the recovery sweep runs.
    pub sweep_every: StdDuration,
    /// Age before a pending_dispatch job is considered lost.
    pub sweep_grace: Duration,
    pub dispatch_batch: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: StdDuration::from_secs(1),
            misfire_grace: Duration::seconds(10),
            sweep_every: StdDuration::from_secs(60),
            sweep_grace: Duration::seconds(30),
            dispatch_batch: 100,
        }
    }
}

enum DispatchDecision {
    NotDue,
    Emit { due: DateTime<Utc> },
    SkippedGap { from: DateTime<Utc>, to: Option<DateTime<Utc>> },
}

pub struct Scheduler {
    store: Arc<dyn MetadataStore>,
    bus: Arc<dyn MessageBus>,
    recorder: Arc<Recorder>,
    clock: Arc<dyn Clock>,
    lease: LeaderLease,
    rx: mpsc::Receiver<SchedulerEvent>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        bus: Arc<dyn MessageBus>,
        recorder: Arc<Recorder>,
        clock: Arc<dyn Clock>,
        lease: LeaderLease,
        rx: mpsc::Receiver<SchedulerEvent>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            recorder,
            clock,
            lease,
            rx,
            config,
        }
    }

    /// Claim and dispatch a job if it is due. Safe to call from any path;
    /// the CAS claim makes duplicates lose.
    async fn dispatch(&self, job_id: JobId) -> Result<()> {
        let now = self.clock.now();
        let misfire_grace = self.config.misfire_grace;
        let mut decision = DispatchDecision::NotDue;

        let claimed = store::modify::<Job, _>(
            self.store.as_ref(),
            collections::JOBS,
            &job_id.to_string(),
            |job| {
                decision = DispatchDecision::NotDue;
                if !matches!(job.status, JobStatus::PendingDispatch | JobStatus::Active) {
                    return Ok(false);
                }
                let Some(due) = job.next_fire_at else {
                    return Ok(false);
                };
                if due > now {
                    return Ok(false);
                }

                match &job.schedule {
                    Schedule::Cron(expr) => {
                        let next = next_cron_occurrence(expr, now)?;
                        job.next_fire_at = next;
                        job.status = JobStatus::Active;
                        if now - due > misfire_grace {
                            decision = DispatchDecision::SkippedGap { from: due, to: next };
                        } else {
                            decision = DispatchDecision::Emit { due };
                        }
                    }
                    _ => {
                        job.next_fire_at = None;
                        job.status = JobStatus::Active;
                        decision = DispatchDecision::Emit { due };
                    }
                }
                Ok(true)
            },
        )
        .await?;

        let Some(job) = claimed else {
            return Ok(());
        };

        match decision {
            DispatchDecision::NotDue => Ok(()),
            DispatchDecision::SkippedGap { from, to } => {
                warn!(
                    job_id = %job_id,
                    missed_at = %from,
                    next_at = ?to,
                    "skipping missed cron firing"
                );
                let event = json!({
                    "event": "missed_firing_skipped",
                    "job_id": job_id,
                    "missed_at": from,
                    "next_at": to,
                    "recorded_at": now,
                });
                self.store
                    .insert(
                        collections::SCHEDULER_EVENTS,
                        &Uuid::new_v4().to_string(),
                        event,
                    )
                    .await?;
                Ok(())
            }
            DispatchDecision::Emit { due } => self.emit(job, due).await,
        }
    }

    /// Record the queued attempt and publish its message. A publish failure
    /// rolls the job back to `pending_dispatch` for the recovery sweep.
    async fn emit(&self, job: Job, due: DateTime<Utc>) -> Result<()> {
        let execution = self.recorder.record_queued(&job).await?;
        let request = ExecutionRequest {
            job_id: job.id,
            tenant_id: job.tenant_id,
            kind: job.kind,
            priority: job.priority,
            ordering_key: job.ordering_key.clone(),
            retry: job.retry_policy,
            timeout_ms: job.timeout_ms,
            enqueued_at: self.clock.now(),
        };

        match self.bus.queue(job.kind).publish(request).await {
            Ok(()) => {
                debug!(
                    job_id = %job.id,
                    attempt = execution.attempt_number,
                    "execution request published"
                );
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "publish failed, reverting to pending_dispatch");
                // Settle the orphaned queued row; a fresh attempt is
                // recorded when the sweep re-dispatches.
                let _ = self
                    .recorder
                    .finish(
                        execution.id,
                        Outcome::Cancelled,
                        Some(("publish_failed".into(), e.to_string())),
                    )
                    .await;
                store::modify::<Job, _>(
                    self.store.as_ref(),
                    collections::JOBS,
                    &job.id.to_string(),
                    |row| {
                        if row.status.is_terminal() {
                            return Ok(false);
                        }
                        row.status = JobStatus::PendingDispatch;
                        // Restore the missed firing so the sweep retries it.
                        // For cron jobs the claim already advanced
                        // next_fire_at; winding it back to `due` re-dispatches
                        // this firing, and if the outage outlasts the misfire
                        // grace the re-dispatch records the gap event.
                        row.next_fire_at = Some(due);
                        Ok(true)
                    },
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Scan for due jobs and dispatch them in `(priority desc, created_at
    /// asc, id asc)` order.
    async fn flush_due(&self) -> Result<()> {
        let now = self.clock.now();
        let mut due: Vec<Job> = Vec::new();
        for status in [JobStatus::PendingDispatch, JobStatus::Active] {
            let docs = self
                .store
                .query(
                    Query::new(collections::JOBS)
                        .eq("status", status.as_str())
                        .lte_num("next_fire_at", now.timestamp_millis())
                        .limit(self.config.dispatch_batch),
                )
                .await?;
            for doc in docs {
                due.push(doc.body_as()?);
            }
        }

        due.sort_by(|a, b| {
            (a.priority.rank(), a.created_at, a.id).cmp(&(b.priority.rank(), b.created_at, b.id))
        });

        for job in due {
            if let Err(e) = self.dispatch(job.id).await {
                error!(job_id = %job.id, error = %e, "dispatch failed");
            }
        }
        Ok(())
    }

    /// Re-enqueue pending_dispatch jobs whose intake notification was lost.
    async fn recovery_sweep(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.config.sweep_grace;
        let docs = self
            .store
            .query(
                Query::new(collections::JOBS)
                    .eq("status", JobStatus::PendingDispatch.as_str())
                    .lte_num("next_fire_at", cutoff.timestamp_millis())
                    .limit(self.config.dispatch_batch),
            )
            .await?;

        let mut swept = 0;
        for doc in docs {
            let job: Job = doc.body_as()?;
            if let Err(e) = self.dispatch(job.id).await {
                error!(job_id = %job.id, error = %e, "recovery dispatch failed");
            } else {
                swept += 1;
            }
        }
        if swept > 0 {
            info!(count = swept, "recovery sweep re-dispatched pending jobs");
        }
        Ok(swept)
    }
}

#[async_trait::async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> AnyResult<()> {
        info!(holder = %self.lease.holder_id(), "scheduler starting");

        // Startup sweep: anything stranded while we were down.
        if let Err(e) = self.recovery_sweep().await {
            error!(error = %e, "startup recovery sweep failed");
        }

        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.rx.recv() => {
                    match event {
                        // One-shot intake events dispatch from any replica;
                        // the CAS claim keeps it single-flight.
                        Some(SchedulerEvent::JobSubmitted(job_id)) => {
                            if let Err(e) = self.dispatch(job_id).await {
                                error!(job_id = %job_id, error = %e, "event dispatch failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    match self.lease.maintain().await {
                        Ok(true) => {
                            if let Err(e) = self.flush_due().await {
                                error!(error = %e, "due-job flush failed");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "lease maintenance failed"),
                    }
                }
                _ = sweep.tick() => {
                    if self.lease.is_held() {
                        if let Err(e) = self.recovery_sweep().await {
                            error!(error = %e, "recovery sweep failed");
                        }
                    }
                }
            }
        }

        if let Err(e) = self.lease.release().await {
            warn!(error = %e, "lease release failed during shutdown");
        }
        info!("scheduler stopped");
        Ok(())
    }
}
