//! Bearer credential extraction.
//!
//! The extractor only pulls the raw key off the request; resolution and
//! rate limiting happen in each handler against the operation it performs,
//! so the governor sees the correct operation class.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::common::Error;
use crate::server::error::ApiError;

/// The raw bearer key from the `Authorization` header.
#[derive(Debug, Clone)]
pub struct BearerKey(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for BearerKey {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ApiError::from(Error::Unauthenticated("missing Authorization header".into()))
            })?;

        let key = header.strip_prefix("Bearer ").unwrap_or(header).trim();
        if key.is_empty() {
            return Err(ApiError::from(Error::Unauthenticated(
                "empty bearer credential".into(),
            )));
        }
        Ok(BearerKey(key.to_string()))
    }
}
