//! Scheduled maintenance tasks.
//!
//! Retention enforcement runs on a cron schedule independent of the job
//! queue: artifacts past their retention window are deleted blob-first so a
//! metadata record never points at a missing blob for longer than one sweep.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::blob::BlobStore;
use crate::common::error::Result as CoreResult;
use crate::domains::artifacts::Artifact;
use crate::domains::executions::ExecutionState;
use crate::store::{collections, MetadataStore, Query};

#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    pub artifact_days: i64,
    pub execution_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            artifact_days: 90,
            execution_days: 30,
        }
    }
}

const SWEEP_BATCH: i64 = 200;

/// Start the maintenance scheduler. The retention sweep runs nightly at
/// 03:00 UTC.
pub async fn start_maintenance(
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    config: RetentionConfig,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let sweep_store = store.clone();
    let sweep_blobs = blobs.clone();
    let retention_job = Job::new_async("0 0 3 * * *", move |_uuid, _lock| {
        let store = sweep_store.clone();
        let blobs = sweep_blobs.clone();
        Box::pin(async move {
            if let Err(e) = run_retention_sweep(&store, &blobs, config).await {
                tracing::error!(error = %e, "retention sweep failed");
            }
        })
    })?;
    scheduler.add(retention_job).await?;

    scheduler.start().await?;
    tracing::info!(
        artifact_days = config.artifact_days,
        execution_days = config.execution_days,
        "maintenance scheduler started"
    );
    Ok(scheduler)
}

/// Delete artifacts and terminal executions past their retention windows.
pub async fn run_retention_sweep(
    store: &Arc<dyn MetadataStore>,
    blobs: &Arc<dyn BlobStore>,
    config: RetentionConfig,
) -> CoreResult<u64> {
    let now = Utc::now();
    let mut removed = 0u64;

    let artifact_cutoff = now - Duration::days(config.artifact_days);
    loop {
        let expired = store
            .query(
                Query::new(collections::ARTIFACTS)
                    .created_before(artifact_cutoff)
                    .limit(SWEEP_BATCH),
            )
            .await?;
        if expired.is_empty() {
            break;
        }
        for doc in expired {
            let artifact: Artifact = doc.body_as()?;
            blobs.delete(&artifact.storage_uri).await?;
            store.delete(collections::ARTIFACTS, &doc.id).await?;
            removed += 1;
        }
    }

    let execution_cutoff = now - Duration::days(config.execution_days);
    for state in ExecutionState::TERMINAL {
        loop {
            let expired = store
                .query(
                    Query::new(collections::EXECUTIONS)
                        .eq("state", state.as_str())
                        .created_before(execution_cutoff)
                        .limit(SWEEP_BATCH),
                )
                .await?;
            if expired.is_empty() {
                break;
            }
            for doc in expired {
                store.delete(collections::EXECUTIONS, &doc.id).await?;
                removed += 1;
            }
        }
    }

    if removed > 0 {
        tracing::info!(removed, "retention sweep complete");
    }
    Ok(removed)
}
