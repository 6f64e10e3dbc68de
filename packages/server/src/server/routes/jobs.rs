//! Job submission, inspection, and cancellation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::common::error::with_backend_retry;
use crate::common::pagination::Page;
use crate::common::{JobId, JobKind};
use crate::domains::auth::Operation;
use crate::domains::executions::Execution;
use crate::domains::jobs::{Job, JobDraft, JobStatus};
use crate::domains::queries::JobFilter;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::server::middleware::BearerKey;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

pub async fn submit_job(
    State(state): State<AppState>,
    key: BearerKey,
    Json(draft): Json<JobDraft>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let principal = state.governor.authorize(&key.0, Operation::SubmitJob).await?;
    // Safe to retry transient store failures: config-hash dedupe makes the
    // submission idempotent.
    let outcome = with_backend_retry("submit_job", || {
        state.intake.submit(&principal, draft.clone())
    })
    .await?;
    Ok((StatusCode::CREATED, Json(outcome.job)))
}

pub async fn get_job(
    State(state): State<AppState>,
    key: BearerKey,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    let principal = state.governor.authorize(&key.0, Operation::GetJob).await?;
    let job = state.queries.get_job(&principal, JobId::from_uuid(id)).await?;
    Ok(Json(job))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    key: BearerKey,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Page<Job>>> {
    let principal = state.governor.authorize(&key.0, Operation::ListJobs).await?;
    let filter = JobFilter {
        kind: query.kind,
        status: query.status,
        created_after: query.created_after,
        created_before: query.created_before,
    };
    let page = state
        .queries
        .list_jobs(&principal, &filter, query.cursor.as_deref(), query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    key: BearerKey,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let principal = state.governor.authorize(&key.0, Operation::CancelJob).await?;
    let job_id = JobId::from_uuid(id);
    with_backend_retry("cancel_job", || state.intake.cancel(&principal, job_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_job_executions(
    State(state): State<AppState>,
    key: BearerKey,
    Path(id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<Execution>>> {
    let principal = state
        .governor
        .authorize(&key.0, Operation::ListExecutions)
        .await?;
    let page = state
        .queries
        .list_executions(
            &principal,
            JobId::from_uuid(id),
            query.cursor.as_deref(),
            query.limit,
        )
        .await?;
    Ok(Json(page))
}
