//! Execution model: one attempted run of a job.
//!
//! Every attempt is its own row. A retryable failure leaves its row resting
//! in `awaiting_retry`; the redispatched attempt starts a new row, which
//! keeps `attempt_number` values a contiguous prefix of the positive
//! integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::common::error::{Error, Result};
use crate::common::{ArtifactId, ExecutionId, JobId, TenantId};
use crate::store::{collections, MetadataStore, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    AwaitingRetry,
    DeadLettered,
    Cancelled,
}

impl ExecutionState {
    pub const TERMINAL: [ExecutionState; 4] = [
        ExecutionState::Succeeded,
        ExecutionState::Failed,
        ExecutionState::DeadLettered,
        ExecutionState::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Queued => "queued",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::AwaitingRetry => "awaiting_retry",
            ExecutionState::DeadLettered => "dead_lettered",
            ExecutionState::Cancelled => "cancelled",
        }
    }

    /// The transition graph. No state may be skipped and terminal states
    /// never move again.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Pending, Queued) | (Pending, Cancelled) => true,
            (Queued, Running) | (Queued, Cancelled) | (Queued, DeadLettered) => true,
            (Running, Succeeded)
            | (Running, Failed)
            | (Running, AwaitingRetry)
            | (Running, Cancelled)
            | (Running, DeadLettered) => true,
            (AwaitingRetry, Queued) | (AwaitingRetry, Cancelled) | (AwaitingRetry, DeadLettered) => {
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RetryableFailure,
    TerminalFailure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub attempt_number: i32,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub produced_artifacts: Vec<ArtifactId>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub async fn find(
        store: &Arc<dyn MetadataStore>,
        id: ExecutionId,
    ) -> Result<Option<Execution>> {
        let doc = store.get(collections::EXECUTIONS, &id.to_string()).await?;
        doc.map(|d| d.body_as()).transpose()
    }

    pub async fn require(store: &Arc<dyn MetadataStore>, id: ExecutionId) -> Result<Execution> {
        Self::find(store, id)
            .await?
            .ok_or_else(|| Error::not_found("execution", id))
    }

    /// All executions of a job, oldest first.
    pub async fn list_for_job(
        store: &Arc<dyn MetadataStore>,
        job_id: JobId,
    ) -> Result<Vec<Execution>> {
        let docs = store
            .query(
                Query::new(collections::EXECUTIONS)
                    .eq("job_id", job_id.to_string())
                    .limit(1_000),
            )
            .await?;
        let mut executions: Vec<Execution> =
            docs.iter().map(|d| d.body_as()).collect::<Result<_>>()?;
        executions.sort_by_key(|e| e.attempt_number);
        Ok(executions)
    }

    /// The highest-attempt execution of a job, if any.
    pub async fn latest_for_job(
        store: &Arc<dyn MetadataStore>,
        job_id: JobId,
    ) -> Result<Option<Execution>> {
        Ok(Self::list_for_job(store, job_id).await?.into_iter().last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_move() {
        for terminal in ExecutionState::TERMINAL {
            for next in [
                ExecutionState::Pending,
                ExecutionState::Queued,
                ExecutionState::Running,
                ExecutionState::Succeeded,
                ExecutionState::Failed,
                ExecutionState::AwaitingRetry,
                ExecutionState::DeadLettered,
                ExecutionState::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} -> {next:?} must be rejected"
                );
            }
        }
    }

    #[test]
    fn happy_path_transitions() {
        assert!(ExecutionState::Pending.can_transition_to(ExecutionState::Queued));
        assert!(ExecutionState::Queued.can_transition_to(ExecutionState::Running));
        assert!(ExecutionState::Running.can_transition_to(ExecutionState::Succeeded));
    }

    #[test]
    fn retry_and_dlq_transitions() {
        assert!(ExecutionState::Running.can_transition_to(ExecutionState::AwaitingRetry));
        assert!(ExecutionState::AwaitingRetry.can_transition_to(ExecutionState::DeadLettered));
        assert!(ExecutionState::Queued.can_transition_to(ExecutionState::DeadLettered));
    }

    #[test]
    fn cancellation_reaches_non_terminal_states() {
        for state in [
            ExecutionState::Pending,
            ExecutionState::Queued,
            ExecutionState::Running,
            ExecutionState::AwaitingRetry,
        ] {
            assert!(state.can_transition_to(ExecutionState::Cancelled));
        }
    }

    #[test]
    fn states_cannot_be_skipped() {
        assert!(!ExecutionState::Pending.can_transition_to(ExecutionState::Running));
        assert!(!ExecutionState::Queued.can_transition_to(ExecutionState::Succeeded));
        assert!(!ExecutionState::Pending.can_transition_to(ExecutionState::Succeeded));
    }
}
