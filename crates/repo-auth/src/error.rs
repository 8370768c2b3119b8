//! Authentication error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Literal challenge required for docker-client compatibility.
pub const WWW_AUTHENTICATE: &str = "Bearer realm=\"repo-worker\",service=\"repo-worker\"";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No valid authentication token provided")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Insufficient permissions")]
    Denied,

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AuthError::Denied => (StatusCode::FORBIDDEN, "DENIED"),
            _ => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        };

        let body = axum::Json(json!({
            "errors": [{
                "code": code,
                "message": self.to_string(),
                "detail": null
            }]
        }));

        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static(WWW_AUTHENTICATE),
            );
        }
        response
    }
}
