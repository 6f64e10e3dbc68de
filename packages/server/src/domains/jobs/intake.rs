//! Job intake: submission and cancellation.
//!
//! Submission validates the draft into the canonical record, reserves the
//! tenant's dedupe slot, persists atomically, and notifies the scheduler.
//! If the notification is lost, the job stays in `pending_dispatch` and the
//! scheduler's recovery sweep picks it up.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::common::error::{Error, Result};
use crate::common::JobId;
use crate::domains::auth::Principal;
use crate::domains::executions::Recorder;
use crate::domains::scheduler::SchedulerEvent;
use crate::kernel::Clock;
use crate::store::{collections, encode_body, MetadataStore, TxOp};

use super::models::{Job, JobDraft, JobStatus};

/// Result of a submission: the job plus whether it was newly created or an
/// idempotent duplicate of a live one.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: Job,
    pub created: bool,
}

pub struct Intake {
    store: Arc<dyn MetadataStore>,
    bus: Arc<dyn MessageBus>,
    recorder: Arc<Recorder>,
    scheduler_tx: mpsc::Sender<SchedulerEvent>,
    clock: Arc<dyn Clock>,
}

impl Intake {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        bus: Arc<dyn MessageBus>,
        recorder: Arc<Recorder>,
        scheduler_tx: mpsc::Sender<SchedulerEvent>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bus,
            recorder,
            scheduler_tx,
            clock,
        }
    }

    pub async fn submit(&self, principal: &Principal, draft: JobDraft) -> Result<SubmitOutcome> {
        let now = self.clock.now();
        let job = Job::from_draft(draft, principal.tenant_id, now)?;

        let outcome = if job.dedupe {
            self.submit_deduped(job).await?
        } else {
            self.store
                .insert(collections::JOBS, &job.id.to_string(), encode_body(&job)?)
                .await?;
            SubmitOutcome { job, created: true }
        };

        if outcome.created {
            info!(
                job_id = %outcome.job.id,
                tenant_id = %outcome.job.tenant_id,
                kind = %outcome.job.kind,
                "job submitted"
            );
            self.notify_scheduler(outcome.job.id).await;
        }
        Ok(outcome)
    }

    /// Insert the job and its dedupe reservation atomically. When the
    /// reservation is already held by a live job, that job is returned
    /// instead; a reservation left behind by a terminal job is replaced.
    async fn submit_deduped(&self, job: Job) -> Result<SubmitOutcome> {
        let dedupe_id = Job::dedupe_key(job.tenant_id, &job.config_hash);
        const MAX_RACES: usize = 3;

        for _ in 0..MAX_RACES {
            match self.store.get(collections::JOB_DEDUPE, &dedupe_id).await? {
                None => {
                    let result = self
                        .store
                        .transact(vec![
                            TxOp::Insert {
                                collection: collections::JOBS.into(),
                                id: job.id.to_string(),
                                body: encode_body(&job)?,
                            },
                            TxOp::Insert {
                                collection: collections::JOB_DEDUPE.into(),
                                id: dedupe_id.clone(),
                                body: serde_json::json!({"job_id": job.id}),
                            },
                        ])
                        .await;
                    match result {
                        Ok(()) => return Ok(SubmitOutcome { job, created: true }),
                        Err(Error::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some(reservation) => {
                    let existing_id: JobId = reservation
                        .body
                        .get("job_id")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            Error::Internal(anyhow::anyhow!(
                                "corrupt dedupe reservation {dedupe_id}"
                            ))
                        })?;

                    if let Some(existing) = Job::find(&self.store, existing_id).await? {
                        if !existing.status.is_terminal() {
                            return Ok(SubmitOutcome {
                                job: existing,
                                created: false,
                            });
                        }
                    }

                    // Stale reservation: point it at the new job.
                    let result = self
                        .store
                        .transact(vec![
                            TxOp::Insert {
                                collection: collections::JOBS.into(),
                                id: job.id.to_string(),
                                body: encode_body(&job)?,
                            },
                            TxOp::Put {
                                collection: collections::JOB_DEDUPE.into(),
                                id: dedupe_id.clone(),
                                expected_version: reservation.version,
                                body: serde_json::json!({"job_id": job.id}),
                            },
                        ])
                        .await;
                    match result {
                        Ok(()) => return Ok(SubmitOutcome { job, created: true }),
                        Err(Error::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(Error::Conflict(
            "concurrent submissions raced on the dedupe reservation".into(),
        ))
    }

    async fn notify_scheduler(&self, job_id: JobId) {
        if let Err(e) = self.scheduler_tx.try_send(SchedulerEvent::JobSubmitted(job_id)) {
            // The job stays pending_dispatch; the recovery sweep re-enqueues.
            warn!(
                job_id = %job_id,
                error = %e,
                "scheduler notification failed, leaving job for recovery sweep"
            );
        }
    }

    /// Cancel a job: park the record, drop undelivered queue messages, and
    /// cancel every not-yet-running execution. In-flight executions observe
    /// the cancelled job through their lease renewer and stop within their
    /// grace period. Cancelling an already-terminal job is a no-op.
    pub async fn cancel(&self, principal: &Principal, job_id: JobId) -> Result<()> {
        let now = self.clock.now();
        let job = Job::require(&self.store, job_id).await?;
        if job.tenant_id != principal.tenant_id {
            // Do not leak other tenants' job ids.
            return Err(Error::not_found("job", job_id));
        }
        if job.status.is_terminal() {
            return Ok(());
        }

        Job::transition_status(
            &self.store,
            job_id,
            &[JobStatus::PendingDispatch, JobStatus::Active],
            JobStatus::Cancelled,
            now,
        )
        .await?;

        let purged = self.bus.queue(job.kind).purge_job(job_id).await?;
        let cancelled = self.recorder.cancel_pending(job_id).await?;
        info!(
            job_id = %job_id,
            purged_messages = purged,
            cancelled_executions = cancelled,
            "job cancelled"
        );
        Ok(())
    }
}
