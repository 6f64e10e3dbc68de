//! Execution inspection.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::common::ExecutionId;
use crate::domains::auth::Operation;
use crate::domains::executions::Execution;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::server::middleware::BearerKey;

pub async fn get_execution(
    State(state): State<AppState>,
    key: BearerKey,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Execution>> {
    let principal = state
        .governor
        .authorize(&key.0, Operation::GetExecution)
        .await?;
    let execution = state
        .queries
        .get_execution(&principal, ExecutionId::from_uuid(id))
        .await?;
    Ok(Json(execution))
}
