//! Job model: the persisted form of a submitted JobSpec.
//!
//! The client-authored fields (kind, parameters, schedule, retry policy,
//! priority, ordering key) are immutable after submission; configuration
//! changes are expressed by submitting a new job. The server-owned tail
//! (status, next fire time) moves under document CAS.

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use typed_builder::TypedBuilder;

use crate::common::error::{Error, Result};
use crate::common::hash::canonical_digest;
use crate::common::{JobId, JobKind, Priority, RetryPolicy, TenantId};
use crate::store::{self, collections, MetadataStore};

use super::params::Parameters;

/// Default per-job execution timeout when the client does not set one.
pub const DEFAULT_TIMEOUT_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted but the scheduler has not picked it up yet; the recovery
    /// sweep guarantees eventual enqueue.
    #[default]
    PendingDispatch,
    /// Under scheduler/queue control.
    Active,
    Completed,
    Failed,
    DeadLettered,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::DeadLettered | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PendingDispatch => "pending_dispatch",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// When a job runs: immediately, once at a fixed time, or on a cron
/// expression (seconds-resolution, UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Once(String),
    Delayed { not_before: DateTime<Utc> },
    Cron(String),
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Once("now".into())
    }
}

impl Schedule {
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Once(when) => {
                if when != "now" {
                    return Err(Error::InvalidRequest(format!(
                        "one-shot schedule must be {{\"once\": \"now\"}}, got {when:?}"
                    )));
                }
                Ok(())
            }
            Schedule::Delayed { .. } => Ok(()),
            Schedule::Cron(expr) => {
                CronSchedule::from_str(expr).map_err(|e| {
                    Error::InvalidRequest(format!("invalid cron expression {expr:?}: {e}"))
                })?;
                Ok(())
            }
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Schedule::Cron(_))
    }

    /// First moment this schedule becomes due, relative to `now`.
    pub fn initial_fire(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Once(_) => Ok(Some(now)),
            Schedule::Delayed { not_before } => Ok(Some(*not_before)),
            Schedule::Cron(expr) => next_cron_occurrence(expr, now),
        }
    }
}

/// Next cron occurrence strictly after `after`.
pub fn next_cron_occurrence(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = CronSchedule::from_str(expr)
        .map_err(|e| Error::Internal(anyhow::anyhow!("stored cron expression invalid: {e}")))?;
    Ok(schedule.after(&after).next())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub parameters: Parameters,
    pub schedule: Schedule,
    pub retry_policy: RetryPolicy,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    pub status: JobStatus,
    pub config_hash: String,
    pub dedupe: bool,
    pub timeout_ms: i64,
    /// Epoch milliseconds so due-time scans can use a numeric index filter.
    #[serde(
        with = "chrono::serde::ts_milliseconds_option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Client-submitted job description, before validation.
#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct JobDraft {
    pub kind: JobKind,
    pub parameters: serde_json::Value,
    #[serde(default)]
    #[builder(default)]
    pub schema_version: Option<i32>,
    #[serde(default)]
    #[builder(default)]
    pub schedule: Schedule,
    #[serde(default)]
    #[builder(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    #[builder(default)]
    pub priority: Priority,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub ordering_key: Option<String>,
    /// Dedupe identical live submissions by config hash (on by default).
    #[serde(default = "default_dedupe")]
    #[builder(default = true)]
    pub dedupe: bool,
    #[serde(default)]
    #[builder(default)]
    pub timeout_ms: Option<i64>,
}

fn default_dedupe() -> bool {
    true
}

impl Job {
    /// Validate a draft and build the canonical record. The config hash
    /// covers everything that defines the work, so identical submissions
    /// collide and dedupe.
    pub fn from_draft(draft: JobDraft, tenant_id: TenantId, now: DateTime<Utc>) -> Result<Job> {
        let parameters = Parameters::from_value(draft.kind, draft.schema_version, draft.parameters)?;
        draft.schedule.validate()?;
        draft.retry_policy.validate()?;
        if let Some(timeout) = draft.timeout_ms {
            if timeout <= 0 {
                return Err(Error::InvalidRequest("timeout_ms must be positive".into()));
            }
        }
        if let Some(key) = &draft.ordering_key {
            if key.is_empty() || key.len() > 256 {
                return Err(Error::InvalidRequest(
                    "ordering_key must be 1..=256 characters".into(),
                ));
            }
        }

        let config_hash = canonical_digest(&(
            draft.kind,
            &parameters,
            &draft.schedule,
            &draft.ordering_key,
        ))?;

        let next_fire_at = draft.schedule.initial_fire(now)?;
        Ok(Job {
            id: JobId::new(),
            tenant_id,
            kind: draft.kind,
            parameters,
            schedule: draft.schedule,
            retry_policy: draft.retry_policy,
            priority: draft.priority,
            ordering_key: draft.ordering_key,
            status: JobStatus::PendingDispatch,
            config_hash,
            dedupe: draft.dedupe,
            timeout_ms: draft.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            next_fire_at,
            created_at: now,
            cancelled_at: None,
        })
    }

    pub fn dedupe_key(tenant_id: TenantId, config_hash: &str) -> String {
        format!("{tenant_id}:{config_hash}")
    }

    pub async fn find(store: &Arc<dyn MetadataStore>, id: JobId) -> Result<Option<Job>> {
        let doc = store.get(collections::JOBS, &id.to_string()).await?;
        doc.map(|d| d.body_as()).transpose()
    }

    pub async fn require(store: &Arc<dyn MetadataStore>, id: JobId) -> Result<Job> {
        Self::find(store, id)
            .await?
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// CAS the status from any of `from` to `to`. Returns the updated job,
    /// or `None` when the job is missing or not in an accepted state.
    pub async fn transition_status(
        store: &Arc<dyn MetadataStore>,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut moved = false;
        let updated = store::modify::<Job, _>(
            store.as_ref(),
            collections::JOBS,
            &id.to_string(),
            |job| {
                if !from.contains(&job.status) {
                    moved = false;
                    return Ok(false);
                }
                job.status = to;
                if to == JobStatus::Cancelled {
                    job.cancelled_at = Some(now);
                }
                moved = true;
                Ok(true)
            },
        )
        .await?;
        Ok(updated.filter(|_| moved))
    }
}
