//! HTTP error envelope.
//!
//! Every error leaves the API as `{error, message, details?, trace_id}`;
//! rate limits additionally carry `Retry-After`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::common::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    error: Error,
    trace_id: String,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            error,
            trace_id: Uuid::new_v4().to_string(),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.error {
            Error::InvalidRequest(_) | Error::SchemaNotFound(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::RetryableBackend(_) | Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(trace_id = %self.trace_id, error = %self.error, "request failed");
        } else {
            tracing::debug!(trace_id = %self.trace_id, error = %self.error, "request rejected");
        }

        // Internal details stay in the logs.
        let message = match &self.error {
            Error::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let mut body = json!({
            "error": self.error.kind_label(),
            "message": message,
            "trace_id": self.trace_id,
        });
        if let Error::RateLimited {
            retry_after_seconds,
        } = &self.error
        {
            body["details"] = json!({ "retry_after_seconds": retry_after_seconds });
        }

        let mut response = (status, Json(body)).into_response();
        if let Error::RateLimited {
            retry_after_seconds,
        } = &self.error
        {
            if let Ok(value) = retry_after_seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        let cases = [
            (Error::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED),
            (Error::Unauthorized("x".into()), StatusCode::FORBIDDEN),
            (Error::not_found("job", "j"), StatusCode::NOT_FOUND),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (
                Error::RateLimited {
                    retry_after_seconds: 3,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (Error::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status(), expected);
        }
    }
}
