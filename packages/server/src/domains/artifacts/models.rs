//! Artifact model: one output blob emitted by an execution.
//!
//! Artifacts are content-addressed (the blob digest lives on the record) and
//! sealed once the owning execution terminates; the recorder refuses
//! attachments after finish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::common::error::{Error, Result};
use crate::common::{ArtifactId, ExecutionId, TenantId};
use crate::store::{collections, MetadataStore, Query};

/// Kind-specific descriptive fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub execution_id: ExecutionId,
    pub tenant_id: TenantId,
    pub storage_uri: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub metadata: ArtifactMetadata,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub async fn find(store: &Arc<dyn MetadataStore>, id: ArtifactId) -> Result<Option<Artifact>> {
        let doc = store.get(collections::ARTIFACTS, &id.to_string()).await?;
        doc.map(|d| d.body_as()).transpose()
    }

    pub async fn require(store: &Arc<dyn MetadataStore>, id: ArtifactId) -> Result<Artifact> {
        Self::find(store, id)
            .await?
            .ok_or_else(|| Error::not_found("artifact", id))
    }

    pub async fn list_for_execution(
        store: &Arc<dyn MetadataStore>,
        execution_id: ExecutionId,
    ) -> Result<Vec<Artifact>> {
        let docs = store
            .query(
                Query::new(collections::ARTIFACTS)
                    .eq("execution_id", execution_id.to_string())
                    .limit(1_000),
            )
            .await?;
        docs.iter().map(|d| d.body_as()).collect()
    }
}
