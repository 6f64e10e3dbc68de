//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::common::JobKind;
use crate::server::app::AppState;
use crate::store::Query;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    store: ComponentHealth,
    bus: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn ok() -> Self {
        Self {
            status: "ok".into(),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            status: "error".into(),
            error: Some(error),
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Returns 200 when the store and bus respond, 503 otherwise.
pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let store = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        state.kernel.store.count(Query::new("jobs").limit(1)),
    )
    .await
    {
        Ok(Ok(_)) => ComponentHealth::ok(),
        Ok(Err(e)) => ComponentHealth::failed(e.to_string()),
        Err(_) => ComponentHealth::failed("store probe timeout (>5s)".into()),
    };

    let bus = match state.kernel.bus.queue(JobKind::Scrape).stats().await {
        Ok(_) => ComponentHealth::ok(),
        Err(e) => ComponentHealth::failed(e.to_string()),
    };

    let healthy = store.is_ok() && bus.is_ok();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.into(),
        store,
        bus,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
