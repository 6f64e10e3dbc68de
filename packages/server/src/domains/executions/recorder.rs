//! Execution recorder: the single writer for execution and artifact rows.
//!
//! Every mutation goes through the document version counter, so concurrent
//! conflicting writes lose and retry. Attempt numbers come from a per-job
//! counter document, which keeps them contiguous even when attempts are
//! started by different workers.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::bus::{DlqObserver, ExecutionRequest};
use crate::common::error::{Error, Result};
use crate::common::{ExecutionId, JobId};
use crate::domains::artifacts::Artifact;
use crate::domains::jobs::{Job, JobStatus};
use crate::kernel::Clock;
use crate::store::{self, collections, encode_body, MetadataStore, TxOp};

use super::models::{Execution, ExecutionState, Outcome};

pub struct Recorder {
    store: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl Recorder {
    pub fn new(store: Arc<dyn MetadataStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Atomically allocate the next attempt number for a job.
    async fn allocate_attempt(&self, job_id: JobId) -> Result<i32> {
        let id = job_id.to_string();
        loop {
            match self.store.get(collections::EXECUTION_ATTEMPTS, &id).await? {
                None => {
                    match self
                        .store
                        .insert(collections::EXECUTION_ATTEMPTS, &id, json!({"next": 2}))
                        .await
                    {
                        Ok(_) => return Ok(1),
                        Err(Error::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some(doc) => {
                    let next = doc.body.get("next").and_then(|v| v.as_i64()).ok_or_else(|| {
                        Error::Internal(anyhow::anyhow!("corrupt attempt counter for job {job_id}"))
                    })?;
                    match self
                        .store
                        .put(
                            collections::EXECUTION_ATTEMPTS,
                            &id,
                            doc.version,
                            json!({"next": next + 1}),
                        )
                        .await
                    {
                        Ok(_) => return Ok(next as i32),
                        Err(Error::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Create the next attempt's row in `queued` at dispatch time.
    pub async fn record_queued(&self, job: &Job) -> Result<Execution> {
        let now = self.clock.now();
        let execution = Execution {
            id: ExecutionId::new(),
            job_id: job.id,
            tenant_id: job.tenant_id,
            attempt_number: self.allocate_attempt(job.id).await?,
            state: ExecutionState::Queued,
            dispatched_at: Some(now),
            started_at: None,
            finished_at: None,
            worker_id: None,
            outcome: None,
            error_kind: None,
            error_detail: None,
            produced_artifacts: Vec::new(),
            created_at: now,
        };
        self.store
            .insert(
                collections::EXECUTIONS,
                &execution.id.to_string(),
                encode_body(&execution)?,
            )
            .await?;
        Ok(execution)
    }

    /// Claim the job's current attempt for a worker: `queued -> running`.
    ///
    /// When the queued row is gone (redelivery after a nack or an expired
    /// lease), a fresh attempt row is allocated; a previous attempt stuck in
    /// `running` is first settled as a lease-expired retryable failure. A
    /// second concurrent `running` claim loses its CAS and errors
    /// (won-by-first).
    pub async fn begin(&self, job: &Job, worker_id: &str) -> Result<Execution> {
        let now = self.clock.now();

        if let Some(latest) = Execution::latest_for_job(&self.store, job.id).await? {
            match latest.state {
                ExecutionState::Queued => {
                    let worker = worker_id.to_string();
                    let updated = store::modify::<Execution, _>(
                        self.store.as_ref(),
                        collections::EXECUTIONS,
                        &latest.id.to_string(),
                        |execution| {
                            if execution.state != ExecutionState::Queued {
                                return Err(Error::Conflict(format!(
                                    "execution {} already claimed",
                                    execution.id
                                )));
                            }
                            execution.state = ExecutionState::Running;
                            execution.started_at = Some(now);
                            execution.worker_id = Some(worker.clone());
                            Ok(true)
                        },
                    )
                    .await?
                    .ok_or_else(|| Error::not_found("execution", latest.id))?;
                    return Ok(updated);
                }
                ExecutionState::Running => {
                    // The previous holder's lease expired; settle its row
                    // before starting the next attempt.
                    store::modify::<Execution, _>(
                        self.store.as_ref(),
                        collections::EXECUTIONS,
                        &latest.id.to_string(),
                        |execution| {
                            if execution.state != ExecutionState::Running {
                                return Ok(false);
                            }
                            execution.state = ExecutionState::AwaitingRetry;
                            execution.outcome = Some(Outcome::RetryableFailure);
                            execution.error_kind = Some("lease_expired".into());
                            execution.error_detail =
                                Some("worker lease expired before completion".into());
                            execution.finished_at = Some(now);
                            Ok(true)
                        },
                    )
                    .await?;
                }
                _ => {}
            }
        }

        let execution = Execution {
            id: ExecutionId::new(),
            job_id: job.id,
            tenant_id: job.tenant_id,
            attempt_number: self.allocate_attempt(job.id).await?,
            state: ExecutionState::Running,
            dispatched_at: Some(now),
            started_at: Some(now),
            finished_at: None,
            worker_id: Some(worker_id.to_string()),
            outcome: None,
            error_kind: None,
            error_detail: None,
            produced_artifacts: Vec::new(),
            created_at: now,
        };
        self.store
            .insert(
                collections::EXECUTIONS,
                &execution.id.to_string(),
                encode_body(&execution)?,
            )
            .await?;
        Ok(execution)
    }

    /// Settle an execution with its outcome. Idempotent: repeating the same
    /// outcome is a no-op; a different outcome fails with `Conflict`.
    pub async fn finish(
        &self,
        execution_id: ExecutionId,
        outcome: Outcome,
        error: Option<(String, String)>,
    ) -> Result<Execution> {
        let now = self.clock.now();
        let target = match outcome {
            Outcome::Success => ExecutionState::Succeeded,
            Outcome::RetryableFailure => ExecutionState::AwaitingRetry,
            Outcome::TerminalFailure => ExecutionState::Failed,
            Outcome::Cancelled => ExecutionState::Cancelled,
        };

        store::modify::<Execution, _>(
            self.store.as_ref(),
            collections::EXECUTIONS,
            &execution_id.to_string(),
            |execution| {
                if let Some(existing) = execution.outcome {
                    if existing == outcome {
                        return Ok(false);
                    }
                    return Err(Error::Conflict(format!(
                        "conflicting finish for execution {execution_id}: {existing:?} vs {outcome:?}"
                    )));
                }
                if !execution.state.can_transition_to(target) {
                    return Err(Error::Conflict(format!(
                        "illegal transition {:?} -> {target:?} for execution {execution_id}",
                        execution.state
                    )));
                }
                execution.state = target;
                execution.outcome = Some(outcome);
                execution.finished_at = Some(now);
                if let Some((kind, detail)) = &error {
                    execution.error_kind = Some(kind.clone());
                    execution.error_detail = Some(detail.clone());
                }
                Ok(true)
            },
        )
        .await?
        .ok_or_else(|| Error::not_found("execution", execution_id))
    }

    /// Persist an artifact and append it to the execution, atomically.
    /// Forbidden once the execution has finished.
    pub async fn attach_artifact(&self, artifact: Artifact) -> Result<()> {
        const MAX_CAS_RETRIES: usize = 5;
        for _ in 0..MAX_CAS_RETRIES {
            let doc = self
                .store
                .get(collections::EXECUTIONS, &artifact.execution_id.to_string())
                .await?
                .ok_or_else(|| Error::not_found("execution", artifact.execution_id))?;
            let mut execution: Execution = doc.body_as()?;

            if execution.outcome.is_some() || execution.state.is_terminal() {
                return Err(Error::Conflict(format!(
                    "cannot attach artifact to finished execution {}",
                    execution.id
                )));
            }
            if execution.produced_artifacts.contains(&artifact.id) {
                return Ok(());
            }
            execution.produced_artifacts.push(artifact.id);

            let result = self
                .store
                .transact(vec![
                    TxOp::Insert {
                        collection: collections::ARTIFACTS.into(),
                        id: artifact.id.to_string(),
                        body: encode_body(&artifact)?,
                    },
                    TxOp::Put {
                        collection: collections::EXECUTIONS.into(),
                        id: execution.id.to_string(),
                        expected_version: doc.version,
                        body: encode_body(&execution)?,
                    },
                ])
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!(
            "too many concurrent writers on execution {}",
            artifact.execution_id
        )))
    }

    /// Transition every not-yet-running execution of a job to `cancelled`.
    pub async fn cancel_pending(&self, job_id: JobId) -> Result<usize> {
        let now = self.clock.now();
        let mut cancelled = 0;
        for execution in Execution::list_for_job(&self.store, job_id).await? {
            let eligible = matches!(
                execution.state,
                ExecutionState::Pending | ExecutionState::Queued | ExecutionState::AwaitingRetry
            );
            if !eligible {
                continue;
            }
            let updated = store::modify::<Execution, _>(
                self.store.as_ref(),
                collections::EXECUTIONS,
                &execution.id.to_string(),
                |row| {
                    if !row.state.can_transition_to(ExecutionState::Cancelled) {
                        return Ok(false);
                    }
                    row.state = ExecutionState::Cancelled;
                    row.outcome = Some(Outcome::Cancelled);
                    row.finished_at = Some(now);
                    Ok(true)
                },
            )
            .await?;
            if updated.is_some_and(|row| row.state == ExecutionState::Cancelled) {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Record a dead-letter transfer observed on the bus: settle the
    /// latest attempt, park the job, and index it for the DLQ admin surface.
    pub async fn record_dead_lettered(
        &self,
        request: &ExecutionRequest,
        last_error: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();

        if let Some(latest) = Execution::latest_for_job(&self.store, request.job_id).await? {
            if !latest.state.is_terminal() {
                store::modify::<Execution, _>(
                    self.store.as_ref(),
                    collections::EXECUTIONS,
                    &latest.id.to_string(),
                    |execution| {
                        if !execution.state.can_transition_to(ExecutionState::DeadLettered) {
                            return Ok(false);
                        }
                        execution.state = ExecutionState::DeadLettered;
                        if execution.outcome.is_none() {
                            execution.outcome = Some(Outcome::RetryableFailure);
                        }
                        execution.error_kind.get_or_insert("retry_exhausted".into());
                        if let Some(detail) = last_error {
                            execution.error_detail.get_or_insert(detail.to_string());
                        }
                        execution.finished_at.get_or_insert(now);
                        Ok(true)
                    },
                )
                .await?;
            }
        }

        Job::transition_status(
            &self.store,
            request.job_id,
            &[JobStatus::PendingDispatch, JobStatus::Active],
            JobStatus::DeadLettered,
            now,
        )
        .await?;

        let index_entry = json!({
            "job_id": request.job_id,
            "tenant_id": request.tenant_id,
            "kind": request.kind,
            "reason": last_error.unwrap_or("retry budget exhausted"),
            "dead_lettered_at": now,
        });
        match self
            .store
            .insert(collections::DLQ_INDEX, &request.job_id.to_string(), index_entry)
            .await
        {
            Ok(_) | Err(Error::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Inverse of a dead-letter transfer, used by the admin redrive.
    pub async fn clear_dead_letter(&self, job_id: JobId) -> Result<()> {
        let now = self.clock.now();
        self.store
            .delete(collections::DLQ_INDEX, &job_id.to_string())
            .await?;
        Job::transition_status(
            &self.store,
            job_id,
            &[JobStatus::DeadLettered],
            JobStatus::Active,
            now,
        )
        .await?;
        Ok(())
    }
}

/// Bridges the bus's dead-letter transfers into the recorder.
pub struct RecorderDlqObserver {
    recorder: Arc<Recorder>,
}

impl RecorderDlqObserver {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl DlqObserver for RecorderDlqObserver {
    async fn on_dead_letter(
        &self,
        request: &ExecutionRequest,
        delivery_attempts: i32,
        last_error: Option<&str>,
    ) {
        tracing::warn!(
            job_id = %request.job_id,
            delivery_attempts,
            "recording dead-lettered execution"
        );
        if let Err(e) = self.recorder.record_dead_lettered(request, last_error).await {
            tracing::error!(
                job_id = %request.job_id,
                error = %e,
                "failed to record dead-letter transition"
            );
        }
    }
}
