//! Blob storage for execution artifacts.
//!
//! Uploads are chunked through an [`UploadHandle`] so workers can stream
//! collaborator output without buffering whole documents; the store returns
//! the final URI, SHA-256 and size when the upload is sealed.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use futures::Stream;
use std::pin::Pin;
use uuid::Uuid;

use crate::common::error::Result;
use crate::common::{ArtifactId, JobKind, TenantId};

pub mod fs;
pub mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Token for an in-progress upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadHandle {
    pub id: Uuid,
}

/// Result of sealing an upload.
#[derive(Debug, Clone)]
pub struct FinishedUpload {
    pub uri: String,
    pub sha256: String,
    pub size_bytes: i64,
}

/// Storage location for a new artifact:
/// `{tenant}/{kind}/{YYYY}/{MM}/{DD}/{artifact_id}`.
#[derive(Debug, Clone)]
pub struct BlobPath {
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub artifact_id: ArtifactId,
    pub date: DateTime<Utc>,
}

impl BlobPath {
    pub fn render(&self) -> String {
        format!(
            "{}/{}/{:04}/{:02}/{:02}/{}",
            self.tenant_id,
            self.kind,
            self.date.year(),
            self.date.month(),
            self.date.day(),
            self.artifact_id
        )
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn start_upload(&self, path: &BlobPath) -> Result<UploadHandle>;

    async fn write_chunk(&self, handle: &UploadHandle, chunk: Bytes) -> Result<()>;

    /// Seal the upload. The blob becomes readable at the returned URI and
    /// the handle is consumed.
    async fn finish_upload(&self, handle: UploadHandle) -> Result<FinishedUpload>;

    async fn open_read(&self, uri: &str) -> Result<ByteStream>;

    async fn delete(&self, uri: &str) -> Result<()>;
}
