//! Filesystem blob store for single-node deployments.
//!
//! Blobs land under a root directory following the same path template as
//! the URI. Uploads are staged in a `.staging/` directory and renamed into
//! place on finish, so readers never observe partial blobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::common::error::{Error, Result};
use futures::StreamExt;

use super::{BlobPath, BlobStore, ByteStream, FinishedUpload, UploadHandle};

pub struct FsBlobStore {
    root: PathBuf,
    uploads: Mutex<HashMap<Uuid, PendingUpload>>,
}

struct PendingUpload {
    uri: String,
    staging_path: PathBuf,
    file: fs::File,
    hasher: Sha256,
    size: i64,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    fn io_err(context: &str, e: std::io::Error) -> Error {
        Error::RetryableBackend(format!("{context}: {e}"))
    }

    fn blob_path(&self, uri: &str) -> Result<PathBuf> {
        // URIs are server-generated, but reject traversal anyway.
        if uri.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(Error::InvalidRequest(format!("malformed blob uri {uri}")));
        }
        Ok(self.root.join(uri))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err("create blob directory", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn start_upload(&self, path: &BlobPath) -> Result<UploadHandle> {
        let id = Uuid::new_v4();
        let staging_path = self.root.join(".staging").join(id.to_string());
        Self::ensure_parent(&staging_path).await?;

        let file = fs::File::create(&staging_path)
            .await
            .map_err(|e| Self::io_err("create staging file", e))?;

        let handle = UploadHandle { id };
        self.uploads.lock().expect("upload lock poisoned").insert(
            id,
            PendingUpload {
                uri: path.render(),
                staging_path,
                file,
                hasher: Sha256::new(),
                size: 0,
            },
        );
        Ok(handle)
    }

    async fn write_chunk(&self, handle: &UploadHandle, chunk: Bytes) -> Result<()> {
        // Take the upload out of the map while writing so the lock is not
        // held across the await.
        let mut pending = self
            .uploads
            .lock()
            .expect("upload lock poisoned")
            .remove(&handle.id)
            .ok_or_else(|| Error::Conflict(format!("unknown upload handle {}", handle.id)))?;

        pending.hasher.update(&chunk);
        pending.size += chunk.len() as i64;
        let write = pending.file.write_all(&chunk).await;

        match write {
            Ok(()) => {
                self.uploads
                    .lock()
                    .expect("upload lock poisoned")
                    .insert(handle.id, pending);
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&pending.staging_path).await;
                Err(Self::io_err("write blob chunk", e))
            }
        }
    }

    async fn finish_upload(&self, handle: UploadHandle) -> Result<FinishedUpload> {
        let mut pending = self
            .uploads
            .lock()
            .expect("upload lock poisoned")
            .remove(&handle.id)
            .ok_or_else(|| Error::Conflict(format!("unknown upload handle {}", handle.id)))?;

        pending
            .file
            .flush()
            .await
            .map_err(|e| Self::io_err("flush blob", e))?;
        drop(pending.file);

        let final_path = self.blob_path(&pending.uri)?;
        Self::ensure_parent(&final_path).await?;
        fs::rename(&pending.staging_path, &final_path)
            .await
            .map_err(|e| Self::io_err("seal blob", e))?;

        Ok(FinishedUpload {
            uri: pending.uri,
            sha256: hex::encode(pending.hasher.finalize()),
            size_bytes: pending.size,
        })
    }

    async fn open_read(&self, uri: &str) -> Result<ByteStream> {
        let path = self.blob_path(uri)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("blob", uri));
            }
            Err(e) => return Err(Self::io_err("open blob", e)),
        };
        let stream = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(|e| Self::io_err("read blob", e)));
        Ok(Box::pin(stream))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        let path = self.blob_path(uri)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err("delete blob", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::hash::sha256_hex;
    use crate::common::{ArtifactId, JobKind, TenantId};
    use chrono::Utc;

    fn path() -> BlobPath {
        BlobPath {
            tenant_id: TenantId::new(),
            kind: JobKind::Scrape,
            artifact_id: ArtifactId::new(),
            date: Utc::now(),
        }
    }

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn upload_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let handle = store.start_upload(&path()).await.unwrap();
        store
            .write_chunk(&handle, Bytes::from_static(b"chunk one "))
            .await
            .unwrap();
        store
            .write_chunk(&handle, Bytes::from_static(b"chunk two"))
            .await
            .unwrap();
        let finished = store.finish_upload(handle).await.unwrap();

        assert_eq!(finished.sha256, sha256_hex(b"chunk one chunk two"));
        assert_eq!(finished.size_bytes, 19);

        let body = collect(store.open_read(&finished.uri).await.unwrap()).await;
        assert_eq!(body, b"chunk one chunk two");
    }

    #[tokio::test]
    async fn unfinished_upload_is_not_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let blob_path = path();
        let handle = store.start_upload(&blob_path).await.unwrap();
        store
            .write_chunk(&handle, Bytes::from_static(b"partial"))
            .await
            .unwrap();

        assert!(matches!(
            store.open_read(&blob_path.render()).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn traversal_uri_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.open_read("../../etc/passwd").await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let handle = store.start_upload(&path()).await.unwrap();
        store
            .write_chunk(&handle, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let finished = store.finish_upload(handle).await.unwrap();

        store.delete(&finished.uri).await.unwrap();
        store.delete(&finished.uri).await.unwrap();
    }
}
