//! Operator surface for the dead-letter queues.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{JobId, JobKind};
use crate::domains::auth::Operation;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::server::middleware::BearerKey;

#[derive(Debug, Deserialize)]
pub struct RedriveRequest {
    pub kind: JobKind,
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RedriveResponse {
    pub redriven: Vec<JobId>,
}

/// Move dead-lettered jobs back onto their main queue and reactivate them.
pub async fn redrive_dlq(
    State(state): State<AppState>,
    key: BearerKey,
    Json(request): Json<RedriveRequest>,
) -> ApiResult<Json<RedriveResponse>> {
    let principal = state
        .governor
        .authorize(&key.0, Operation::DlqRedrive)
        .await?;
    let job_ids: Vec<JobId> = request.ids.iter().copied().map(JobId::from_uuid).collect();

    let redriven = state
        .kernel
        .bus
        .queue(request.kind)
        .redrive(&job_ids)
        .await?;
    for job_id in &redriven {
        state.recorder.clear_dead_letter(*job_id).await?;
    }

    tracing::info!(
        principal = %principal.id,
        kind = %request.kind,
        requested = request.ids.len(),
        redriven = redriven.len(),
        "dlq redrive"
    );
    Ok(Json(RedriveResponse { redriven }))
}

#[derive(Debug, Deserialize)]
pub struct DlqListQuery {
    pub kind: JobKind,
}

#[derive(Debug, Serialize)]
pub struct DlqListResponse {
    pub kind: JobKind,
    pub jobs: Vec<JobId>,
}

/// List jobs currently parked in a kind's dead-letter queue.
pub async fn list_dlq(
    State(state): State<AppState>,
    key: BearerKey,
    Query(query): Query<DlqListQuery>,
) -> ApiResult<Json<DlqListResponse>> {
    state.governor.authorize(&key.0, Operation::DlqList).await?;
    let jobs = state.kernel.bus.queue(query.kind).dlq_jobs().await?;
    Ok(Json(DlqListResponse {
        kind: query.kind,
        jobs,
    }))
}
