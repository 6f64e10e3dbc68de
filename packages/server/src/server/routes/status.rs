//! Operational status endpoint.

use axum::extract::State;
use axum::Json;

use crate::domains::queries::StatusReport;
use crate::server::app::AppState;
use crate::server::error::ApiResult;

pub async fn status_handler(State(state): State<AppState>) -> ApiResult<Json<StatusReport>> {
    Ok(Json(state.queries.status().await?))
}
