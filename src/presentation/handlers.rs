// HTTP request handlers
use crate::application::sync_service::HealthReport;
use crate::presentation::app_state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/status", get(sync_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Snapshot of the orchestrator's counters and recent errors
pub async fn sync_status(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.orchestrator.health_report().await)
}
