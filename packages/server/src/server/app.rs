//! Application state and router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::domains::auth::Governor;
use crate::domains::executions::Recorder;
use crate::domains::jobs::Intake;
use crate::domains::queries::QueryService;
use crate::kernel::Kernel;
use crate::server::routes::{
    cancel_job, get_artifact, get_execution, get_job, health_handler, list_dlq,
    list_job_executions, list_jobs, redrive_dlq, status_handler, stream_artifact_body, submit_job,
};

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
    pub governor: Arc<Governor>,
    pub intake: Arc<Intake>,
    pub queries: Arc<QueryService>,
    pub recorder: Arc<Recorder>,
}

pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(Any);

    let v1 = Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route("/jobs/:id/executions", get(list_job_executions))
        .route("/executions/:id", get(get_execution))
        .route("/artifacts/:id", get(get_artifact))
        .route("/artifacts/:id/body", get(stream_artifact_body))
        .route("/admin/dlq", get(list_dlq))
        .route("/admin/dlq/redrive", post(redrive_dlq))
        .route("/status", get(status_handler));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors)
        .with_state(state)
}
