//! In-memory blob store for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::common::error::{Error, Result};
use crate::common::hash::sha256_hex;

use super::{BlobPath, BlobStore, ByteStream, FinishedUpload, UploadHandle};

#[derive(Default)]
pub struct MemoryBlobStore {
    uploads: Mutex<HashMap<Uuid, PendingUpload>>,
    blobs: Mutex<HashMap<String, Bytes>>,
}

struct PendingUpload {
    uri: String,
    buffer: Vec<u8>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read-back for assertions.
    pub fn blob(&self, uri: &str) -> Option<Bytes> {
        self.blobs.lock().expect("blob lock poisoned").get(uri).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn start_upload(&self, path: &BlobPath) -> Result<UploadHandle> {
        let handle = UploadHandle { id: Uuid::new_v4() };
        self.uploads.lock().expect("upload lock poisoned").insert(
            handle.id,
            PendingUpload {
                uri: path.render(),
                buffer: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn write_chunk(&self, handle: &UploadHandle, chunk: Bytes) -> Result<()> {
        let mut uploads = self.uploads.lock().expect("upload lock poisoned");
        let pending = uploads
            .get_mut(&handle.id)
            .ok_or_else(|| Error::Conflict(format!("unknown upload handle {}", handle.id)))?;
        pending.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish_upload(&self, handle: UploadHandle) -> Result<FinishedUpload> {
        let pending = self
            .uploads
            .lock()
            .expect("upload lock poisoned")
            .remove(&handle.id)
            .ok_or_else(|| Error::Conflict(format!("unknown upload handle {}", handle.id)))?;

        let sha256 = sha256_hex(&pending.buffer);
        let size_bytes = pending.buffer.len() as i64;
        let bytes = Bytes::from(pending.buffer);
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .insert(pending.uri.clone(), bytes);

        Ok(FinishedUpload {
            uri: pending.uri,
            sha256,
            size_bytes,
        })
    }

    async fn open_read(&self, uri: &str) -> Result<ByteStream> {
        let bytes = self
            .blob(uri)
            .ok_or_else(|| Error::not_found("blob", uri))?;
        // One chunk is enough here; callers only see a stream.
        let stream = futures::stream::once(async move { Ok(bytes) });
        Ok(Box::pin(stream))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        self.blobs.lock().expect("blob lock poisoned").remove(uri);
        Ok(())
    }
}
