//! Error taxonomy shared by every component.
//!
//! The variants mirror what callers are allowed to do about a failure:
//! surface it, retry against current state, or retry later. Backend adapters
//! translate their native errors into `RetryableBackend`; after local retries
//! are exhausted it degrades to `Unavailable`.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no parameter schema for kind {0}")]
    SchemaNotFound(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient backend failure: {0}")]
    RetryableBackend(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable snake_case label used in the HTTP error envelope and logs.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::SchemaNotFound(_) => "schema_not_found",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::Unauthorized(_) => "unauthorized",
            Error::RateLimited { .. } => "rate_limited",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::RetryableBackend(_) => "retryable_backend",
            Error::Unavailable(_) => "unavailable",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same call and expect it to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RetryableBackend(_) | Error::Unavailable(_) | Error::RateLimited { .. }
        )
    }
}

/// Local retry budget for transient backend failures.
const BACKEND_RETRY_ATTEMPTS: u32 = 3;

/// Run a backend operation, retrying `RetryableBackend` failures with
/// exponential backoff. After the budget is exhausted the failure is
/// propagated as `Unavailable`.
pub async fn with_backend_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Duration::from_millis(50);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(Error::RetryableBackend(msg)) if attempt < BACKEND_RETRY_ATTEMPTS => {
                tracing::warn!(
                    operation = op_name,
                    attempt,
                    error = %msg,
                    "transient backend failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(Error::RetryableBackend(msg)) => {
                return Err(Error::Unavailable(format!("{op_name}: {msg}")));
            }
            other => return other,
        }
    }
}
