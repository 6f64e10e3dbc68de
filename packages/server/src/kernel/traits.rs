//! Collaborator contracts consumed by the engine.
//!
//! Scrapers and OCR engines are pure with respect to system state: they
//! return artifact payloads and an outcome hint, and the worker (not the
//! collaborator) writes blobs and records executions.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::common::error::Result;
use crate::common::TenantId;
use crate::domains::artifacts::ArtifactMetadata;
use crate::domains::auth::Role;
use crate::domains::jobs::{OcrParams, ScrapeParams};

/// Injectable time source. Production uses [`super::SystemClock`]; tests
/// drive a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Context threaded into every collaborator call: a cancellation token the
/// collaborator must honour within a bounded time, and the remaining time
/// budget for the whole execution.
#[derive(Clone)]
pub struct CollabContext {
    pub cancel: CancellationToken,
    pub timeout: Duration,
}

impl CollabContext {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self { cancel, timeout }
    }
}

/// How the collaborator classified its own result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeHint {
    Ok,
    Retryable(String),
    Terminal(String),
}

/// One output blob produced by a collaborator, not yet persisted.
#[derive(Debug, Clone)]
pub struct ArtifactPayload {
    pub content_type: String,
    pub data: Bytes,
    pub metadata: ArtifactMetadata,
}

#[derive(Debug, Clone)]
pub struct CollaboratorOutput {
    pub artifacts: Vec<ArtifactPayload>,
    pub outcome: OutcomeHint,
}

impl CollaboratorOutput {
    pub fn ok(artifacts: Vec<ArtifactPayload>) -> Self {
        Self {
            artifacts,
            outcome: OutcomeHint::Ok,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            artifacts: Vec::new(),
            outcome: OutcomeHint::Retryable(message.into()),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            artifacts: Vec::new(),
            outcome: OutcomeHint::Terminal(message.into()),
        }
    }
}

#[async_trait]
pub trait Scraper: Send + Sync {
    async fn run(&self, params: &ScrapeParams, ctx: &CollabContext) -> Result<CollaboratorOutput>;
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn process(&self, params: &OcrParams, ctx: &CollabContext)
        -> Result<CollaboratorOutput>;
}

/// A validated API key.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub principal_id: String,
    pub tenant_id: TenantId,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait KeyValidator: Send + Sync {
    /// Resolve a bearer key to its record. Unknown keys fail with
    /// `Unauthenticated`; expiry is enforced by the governor against the
    /// injected clock.
    async fn validate(&self, key: &str) -> Result<KeyRecord>;
}
