//! Artifact metadata and body streaming.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use uuid::Uuid;

use crate::common::{ArtifactId, Error};
use crate::domains::artifacts::Artifact;
use crate::domains::auth::Operation;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::server::middleware::BearerKey;

pub async fn get_artifact(
    State(state): State<AppState>,
    key: BearerKey,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Artifact>> {
    let principal = state
        .governor
        .authorize(&key.0, Operation::GetArtifact)
        .await?;
    let artifact = state
        .queries
        .get_artifact(&principal, ArtifactId::from_uuid(id))
        .await?;
    Ok(Json(artifact))
}

pub async fn stream_artifact_body(
    State(state): State<AppState>,
    key: BearerKey,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let principal = state
        .governor
        .authorize(&key.0, Operation::StreamArtifact)
        .await?;
    let (artifact, stream) = state
        .queries
        .stream_artifact_body(&principal, ArtifactId::from_uuid(id))
        .await?;

    let response = Response::builder()
        .header(header::CONTENT_TYPE, artifact.content_type.as_str())
        .header(header::CONTENT_LENGTH, artifact.size_bytes)
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(anyhow::anyhow!("response build failed: {e}")))?;
    Ok(response)
}
