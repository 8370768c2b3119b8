//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] repo_storage::StorageError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] repo_proxy::ProxyError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unknown upstream: {0}")]
    UnknownUpstream(String),
}
