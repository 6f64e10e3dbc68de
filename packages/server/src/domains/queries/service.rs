//! Query and retrieval service.
//!
//! Every read is tenant-scoped through the caller's principal; resources
//! belonging to another tenant answer `NotFound` so ids do not leak.
//! Listings paginate on opaque `(created_at, id)` cursors taken from the
//! stored documents, which keeps pages stable under concurrent inserts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::blob::{BlobStore, ByteStream};
use crate::bus::{MessageBus, QueueStats};
use crate::common::error::{Error, Result};
use crate::common::pagination::{build_page, clamp_limit, Cursor, Page};
use crate::common::{ArtifactId, ExecutionId, JobId, JobKind};
use crate::domains::artifacts::Artifact;
use crate::domains::auth::Principal;
use crate::domains::executions::Execution;
use crate::domains::jobs::{Job, JobStatus};
use crate::store::{collections, Document, MetadataStore, Query};

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub queues: HashMap<String, QueueStats>,
    pub jobs_by_status: HashMap<String, i64>,
    pub dlq_depth: HashMap<String, usize>,
}

pub struct QueryService {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self { store, blobs, bus }
    }

    pub async fn get_job(&self, principal: &Principal, id: JobId) -> Result<Job> {
        let job = Job::require(&self.store, id).await?;
        if job.tenant_id != principal.tenant_id {
            return Err(Error::not_found("job", id));
        }
        Ok(job)
    }

    pub async fn list_jobs(
        &self,
        principal: &Principal,
        filter: &JobFilter,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Page<Job>> {
        let limit = clamp_limit(limit);
        let mut query = Query::new(collections::JOBS)
            .eq("tenant_id", principal.tenant_id.to_string())
            .limit(limit + 1);
        if let Some(kind) = filter.kind {
            query = query.eq("kind", kind.as_str());
        }
        if let Some(status) = filter.status {
            query = query.eq("status", status.as_str());
        }
        if let Some(after) = filter.created_after {
            query = query.created_after(after);
        }
        if let Some(before) = filter.created_before {
            query = query.created_before(before);
        }
        if let Some(cursor) = cursor {
            let cursor = Cursor::decode(cursor)?;
            query = query.after(cursor.created_at, cursor.id.to_string());
        }

        let docs = self.store.query(query).await?;
        let items = decode_with_position::<Job>(docs)?;
        Ok(map_page(build_page(items, limit, |(position, job)| {
            Cursor::new(*position, job.id.into_uuid())
        })))
    }

    pub async fn get_execution(&self, principal: &Principal, id: ExecutionId) -> Result<Execution> {
        let execution = Execution::require(&self.store, id).await?;
        if execution.tenant_id != principal.tenant_id {
            return Err(Error::not_found("execution", id));
        }
        Ok(execution)
    }

    pub async fn list_executions(
        &self,
        principal: &Principal,
        job_id: JobId,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Page<Execution>> {
        // Existence and tenant check first: 404 beats an empty page.
        self.get_job(principal, job_id).await?;

        let limit = clamp_limit(limit);
        let mut query = Query::new(collections::EXECUTIONS)
            .eq("job_id", job_id.to_string())
            .limit(limit + 1);
        if let Some(cursor) = cursor {
            let cursor = Cursor::decode(cursor)?;
            query = query.after(cursor.created_at, cursor.id.to_string());
        }

        let docs = self.store.query(query).await?;
        let items = decode_with_position::<Execution>(docs)?;
        Ok(map_page(build_page(items, limit, |(position, execution)| {
            Cursor::new(*position, execution.id.into_uuid())
        })))
    }

    pub async fn get_artifact(&self, principal: &Principal, id: ArtifactId) -> Result<Artifact> {
        let artifact = Artifact::require(&self.store, id).await?;
        if artifact.tenant_id != principal.tenant_id {
            return Err(Error::not_found("artifact", id));
        }
        Ok(artifact)
    }

    pub async fn stream_artifact_body(
        &self,
        principal: &Principal,
        id: ArtifactId,
    ) -> Result<(Artifact, ByteStream)> {
        let artifact = self.get_artifact(principal, id).await?;
        let stream = self.blobs.open_read(&artifact.storage_uri).await?;
        Ok((artifact, stream))
    }

    /// Unauthenticated operational snapshot for `/v1/status`.
    pub async fn status(&self) -> Result<StatusReport> {
        let mut queues = HashMap::new();
        let mut dlq_depth = HashMap::new();
        for kind in JobKind::ALL {
            let stats = self.bus.queue(kind).stats().await?;
            dlq_depth.insert(kind.to_string(), stats.dlq_depth);
            queues.insert(kind.to_string(), stats);
        }

        let mut jobs_by_status = HashMap::new();
        for status in [
            JobStatus::PendingDispatch,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::DeadLettered,
            JobStatus::Cancelled,
        ] {
            let count = self
                .store
                .count(Query::new(collections::JOBS).eq("status", status.as_str()))
                .await?;
            jobs_by_status.insert(status.as_str().to_string(), count);
        }

        Ok(StatusReport {
            queues,
            jobs_by_status,
            dlq_depth,
        })
    }
}

/// Decode documents, keeping each document's stored position for cursors.
fn decode_with_position<T: serde::de::DeserializeOwned>(
    docs: Vec<Document>,
) -> Result<Vec<(DateTime<Utc>, T)>> {
    docs.iter()
        .map(|doc| Ok((doc.created_at, doc.body_as::<T>()?)))
        .collect()
}

fn map_page<T>(page: Page<(DateTime<Utc>, T)>) -> Page<T> {
    Page {
        items: page.items.into_iter().map(|(_, item)| item).collect(),
        next_cursor: page.next_cursor,
    }
}
