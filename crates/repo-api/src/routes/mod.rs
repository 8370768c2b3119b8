//! API routes

mod health;
mod helm;
mod metrics;
mod registry;

use axum::extract::Request;
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ApiError;
use crate::state::{AppState, MetricsHandle};

/// Overall deadline for read requests.
const READ_DEADLINE: Duration = Duration::from_secs(30);

/// Overall deadline for uploads.
const UPLOAD_DEADLINE: Duration = Duration::from_secs(300);

/// Per-request deadline keyed by method: uploads get longer than reads.
async fn request_deadline(request: Request, next: Next) -> Response {
    let limit = match *request.method() {
        Method::POST | Method::PUT | Method::PATCH => UPLOAD_DEADLINE,
        _ => READ_DEADLINE,
    };

    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::DeadlineExceeded.into_response(),
    }
}

/// Create the main router
pub fn create_router(state: AppState, metrics_handle: Option<Arc<MetricsHandle>>) -> Router {
    let auth = Arc::clone(&state.auth);

    // Registry and chart surfaces sit behind token validation and the
    // per-method deadline; health and metrics stay open.
    let protected = Router::new()
        .merge(registry::routes())
        .merge(helm::routes())
        .layer(middleware::from_fn_with_state(auth, repo_auth::require_auth))
        .layer(middleware::from_fn(request_deadline));

    let mut router = Router::new()
        .merge(health::routes())
        .merge(protected)
        .with_state(state);

    if let Some(handle) = metrics_handle {
        router = router.merge(metrics::routes(handle));
    }

    router
}
