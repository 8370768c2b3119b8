//! Health and readiness endpoints

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde_json::json;

use crate::state::AppState;

/// GET /healthz - liveness; unconditionally healthy once wired
async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

/// GET /readyz - readiness; probes the object-store bucket
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.ensure_bucket().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "error": e.to_string() })),
        ),
    }
}

/// Create health routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
