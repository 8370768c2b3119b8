//! API error types
//!
//! Failure responses follow the OCI error envelope
//! `{"errors": [{"code", "message", "detail"}]}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use repo_core::CoreError;
use repo_proxy::ProxyError;
use repo_storage::StorageError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    #[error("manifest unknown to registry: {0}")]
    ManifestUnknown(String),

    #[error("invalid digest: {0}")]
    DigestInvalid(String),

    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    #[error("invalid reference: {0}")]
    ReferenceInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl ApiError {
    fn envelope(status: StatusCode, code: &str, message: String) -> Response {
        let body = axum::Json(json!({
            "errors": [{
                "code": code,
                "message": message,
                "detail": null
            }]
        }));
        (status, body).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BlobUnknown(msg) => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN", msg.clone()),
            ApiError::ManifestUnknown(msg) => {
                (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", msg.clone())
            }
            ApiError::DigestInvalid(msg) => (StatusCode::BAD_REQUEST, "DIGEST_INVALID", msg.clone()),
            ApiError::NameInvalid(msg) => (StatusCode::BAD_REQUEST, "NAME_INVALID", msg.clone()),
            ApiError::ReferenceInvalid(msg) => {
                (StatusCode::BAD_REQUEST, "TAG_INVALID", msg.clone())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                "UNSUPPORTED",
                "method not allowed".to_string(),
            ),
            ApiError::DeadlineExceeded => (
                StatusCode::GATEWAY_TIMEOUT,
                "UNSUPPORTED",
                "request deadline exceeded".to_string(),
            ),
            ApiError::Core(e) => return core_error_response(e),
        };

        Self::envelope(status, code, message)
    }
}

fn core_error_response(e: &CoreError) -> Response {
    match e {
        CoreError::NotFound(msg) => {
            ApiError::envelope(StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone())
        }
        CoreError::BadRequest(msg) => {
            ApiError::envelope(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
        }
        CoreError::UnknownUpstream(msg) => {
            ApiError::envelope(StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone())
        }
        CoreError::Storage(e) => storage_error_response(e),
        CoreError::Proxy(e) => proxy_error_response(e),
    }
}

fn storage_error_response(e: &StorageError) -> Response {
    match e {
        StorageError::NotFound(msg) => {
            ApiError::envelope(StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone())
        }
        StorageError::InvalidDigest(msg) | StorageError::DigestMismatch { actual: msg, .. } => {
            ApiError::envelope(StatusCode::BAD_REQUEST, "DIGEST_INVALID", msg.clone())
        }
        // Transport-level store failures: the client may retry at will.
        other => ApiError::envelope(
            StatusCode::SERVICE_UNAVAILABLE,
            "UNAVAILABLE",
            other.to_string(),
        ),
    }
}

fn proxy_error_response(e: &ProxyError) -> Response {
    match e {
        ProxyError::NotFound(msg) => {
            ApiError::envelope(StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone())
        }
        ProxyError::Unauthorized | ProxyError::TokenRefreshFailed => ApiError::envelope(
            StatusCode::BAD_GATEWAY,
            "UNAUTHORIZED",
            "upstream authentication failed".to_string(),
        ),
        other => ApiError::envelope(StatusCode::BAD_GATEWAY, "UNAVAILABLE", other.to_string()),
    }
}
