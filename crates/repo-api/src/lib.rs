//! Repo Worker HTTP API
//!
//! Axum router implementing the OCI Distribution v2 surface, the Helm
//! chart repository protocol, and the health/metrics endpoints.

pub mod error;
pub mod routes;
pub mod state;
pub mod validation;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
