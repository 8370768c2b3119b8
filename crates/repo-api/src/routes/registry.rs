//! OCI Distribution v2 routes
//!
//! Repository names contain slashes, so everything under `/v2/` is routed
//! through a wildcard and dispatched by parsing the path tail.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use serde::Deserialize;
use std::time::Instant;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;
use crate::validation::{validate_digest, validate_name, validate_reference};
use repo_core::CoreError;
use repo_storage::StorageError;

const DEFAULT_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Query parameters for upload creation and completion
#[derive(Deserialize)]
pub struct UploadQuery {
    digest: Option<String>,
}

/// Pagination parameters for list endpoints
#[derive(Deserialize)]
pub struct PaginationQuery {
    n: Option<usize>,
    last: Option<String>,
}

// ==================== Version check ====================

/// GET /v2/ - version check
async fn version_check() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::HeaderName::from_static("docker-distribution-api-version"),
                "registry/2.0",
            ),
        ],
        "{}",
    )
        .into_response()
}

// ==================== Routes ====================

/// Create registry routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/v2/", get(version_check)).route(
        "/v2/{*path}",
        get(handle_get_or_head)
            .head(handle_get_or_head)
            .put(handle_put)
            .post(handle_post)
            .patch(handle_patch)
            .delete(handle_delete),
    )
}

// ==================== Path dispatch ====================

enum RegistryRequest {
    Catalog,
    TagsList { name: String },
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    StartUpload { name: String },
    Upload { name: String, session_id: String },
}

/// Parse a `/v2/` path tail into a registry operation.
///
/// Multi-segment repository names (`library/alpine`) make the last
/// meaningful segment the discriminator.
fn parse_registry_path(path: &str) -> Option<RegistryRequest> {
    if path == "_catalog" {
        return Some(RegistryRequest::Catalog);
    }

    if let Some(name) = path.strip_suffix("/tags/list") {
        return Some(RegistryRequest::TagsList {
            name: name.to_string(),
        });
    }

    if let Some(idx) = path.rfind("/manifests/") {
        return Some(RegistryRequest::Manifest {
            name: path[..idx].to_string(),
            reference: path[idx + "/manifests/".len()..].to_string(),
        });
    }

    if let Some(idx) = path.rfind("/blobs/uploads/") {
        let name = path[..idx].to_string();
        let session_id = &path[idx + "/blobs/uploads/".len()..];
        return Some(if session_id.is_empty() {
            RegistryRequest::StartUpload { name }
        } else {
            RegistryRequest::Upload {
                name,
                session_id: session_id.to_string(),
            }
        });
    }

    if let Some(idx) = path.rfind("/blobs/") {
        return Some(RegistryRequest::Blob {
            name: path[..idx].to_string(),
            digest: path[idx + "/blobs/".len()..].to_string(),
        });
    }

    None
}

// ==================== GET / HEAD ====================

async fn handle_get_or_head(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(pagination): Query<PaginationQuery>,
    method: Method,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::Catalog => {
            let repositories = state.registry.list_repositories().await?;
            let repositories =
                paginate(repositories, pagination.n, pagination.last.as_deref());
            Ok(axum::Json(serde_json::json!({ "repositories": repositories })).into_response())
        }
        RegistryRequest::TagsList { name } => {
            validate_name(&name)?;
            // A proxied name lists the tags cached for it so far.
            let repo = match state.proxy.resolve(&name) {
                Some((upstream, image)) => repo_core::CacheManager::proxy_repo(&upstream, &image),
                None => name.clone(),
            };
            let tags = state.registry.list_tags(&repo).await?;
            let tags = paginate(tags, pagination.n, pagination.last.as_deref());
            Ok(axum::Json(serde_json::json!({ "name": name, "tags": tags })).into_response())
        }
        RegistryRequest::Manifest { name, reference } => {
            get_or_head_manifest(&state, &name, &reference, method).await
        }
        RegistryRequest::Blob { name, digest } => {
            get_or_head_blob(&state, &name, &digest, method).await
        }
        RegistryRequest::Upload { name, session_id } => {
            let offset = state
                .registry
                .upload_status(&session_id)
                .map_err(ApiError::Core)?
                .ok_or_else(|| ApiError::NotFound(format!("Upload session: {}", session_id)))?;

            let mut response = StatusCode::NO_CONTENT.into_response();
            let headers = response.headers_mut();
            insert_str(headers, header::LOCATION, &upload_location(&name, &session_id));
            insert_str(headers, header::RANGE, &range_header(offset));
            insert_str(headers, "docker-upload-uuid", &session_id);
            Ok(response)
        }
        RegistryRequest::StartUpload { .. } => Err(ApiError::MethodNotAllowed),
    }
}

async fn get_or_head_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    method: Method,
) -> Result<Response, ApiError> {
    validate_name(name)?;
    validate_reference(reference)?;
    let start = Instant::now();

    debug!("{} manifest: {}:{}", method, name, reference);

    let result = match state.proxy.resolve(name) {
        Some((upstream, image)) => state.proxy.get_manifest(&upstream, &image, reference).await,
        None => state.registry.get_manifest(name, reference).await,
    };

    let (content, digest) = result.map_err(|e| match e {
        CoreError::NotFound(_) => ApiError::ManifestUnknown(format!("{}:{}", name, reference)),
        other => ApiError::Core(other),
    })?;

    observe("manifest_get", start);

    let content_type = manifest_media_type(&content);
    let mut response = if method == Method::HEAD {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::OK, content.clone()).into_response()
    };

    let headers = response.headers_mut();
    insert_str(headers, header::CONTENT_TYPE, &content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content.len() as u64));
    insert_str(headers, "docker-content-digest", &digest);
    Ok(response)
}

async fn get_or_head_blob(
    state: &AppState,
    name: &str,
    digest: &str,
    method: Method,
) -> Result<Response, ApiError> {
    validate_name(name)?;
    validate_digest(digest)?;
    let start = Instant::now();

    debug!("{} blob: {}", method, digest);

    if method == Method::HEAD {
        let size = match state.proxy.resolve(name) {
            Some((upstream, image)) => state.proxy.blob_size(&upstream, &image, digest).await?,
            None => state.registry.blob_size(digest).await?,
        };

        let size = size.ok_or_else(|| ApiError::BlobUnknown(digest.to_string()))?;
        observe("blob_get", start);

        let mut response = StatusCode::OK.into_response();
        let headers = response.headers_mut();
        insert_str(headers, header::CONTENT_TYPE, "application/octet-stream");
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        insert_str(headers, "docker-content-digest", digest);
        return Ok(response);
    }

    let result = match state.proxy.resolve(name) {
        Some((upstream, image)) => state.proxy.get_blob(&upstream, &image, digest).await,
        None => state.registry.get_blob(digest).await,
    };

    let (stream, size) = result.map_err(|e| match e {
        CoreError::NotFound(_) => ApiError::BlobUnknown(digest.to_string()),
        other => ApiError::Core(other),
    })?;

    observe("blob_get", start);

    let body = axum::body::Body::from_stream(stream);
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    insert_str(headers, header::CONTENT_TYPE, "application/octet-stream");
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    insert_str(headers, "docker-content-digest", digest);
    Ok(response)
}

// ==================== PUT ====================

async fn handle_put(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::Manifest { name, reference } => {
            validate_name(&name)?;
            validate_reference(&reference)?;
            let start = Instant::now();
            debug!("PUT manifest: {}:{}", name, reference);

            // Writes always target local storage under the literal name.
            let digest = state
                .registry
                .put_manifest(&name, &reference, body)
                .await
                .map_err(map_digest_errors)?;

            observe("manifest_put", start);

            let mut response = StatusCode::CREATED.into_response();
            let headers = response.headers_mut();
            insert_str(
                headers,
                header::LOCATION,
                &format!("/v2/{}/manifests/{}", name, digest),
            );
            insert_str(headers, "docker-content-digest", &digest);
            Ok(response)
        }
        RegistryRequest::Upload { name, session_id } => {
            validate_name(&name)?;
            let digest = query
                .digest
                .ok_or_else(|| ApiError::BadRequest("missing digest parameter".to_string()))?;
            validate_digest(&digest)?;
            let start = Instant::now();
            debug!("PUT upload: {} -> {}", session_id, digest);

            match state
                .registry
                .complete_upload(&session_id, &digest, &body)
                .await
            {
                Ok(()) => {}
                // The session is gone (finished or swept) but the request
                // carries the whole blob: treat it as a monolithic re-put.
                // Digest verification still applies.
                Err(CoreError::NotFound(_)) if !body.is_empty() => {
                    state
                        .registry
                        .put_blob(&digest, body)
                        .await
                        .map_err(map_digest_errors)?;
                }
                Err(e) => return Err(map_digest_errors(e)),
            }

            observe("blob_put", start);
            Ok(blob_created(&name, &digest))
        }
        _ => Err(ApiError::MethodNotAllowed),
    }
}

// ==================== POST ====================

async fn handle_post(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::StartUpload { name } => {
            validate_name(&name)?;

            // Monolithic single-shot upload
            if let Some(digest) = query.digest {
                validate_digest(&digest)?;
                let start = Instant::now();
                debug!("POST monolithic upload: {} ({} bytes)", digest, body.len());
                state
                    .registry
                    .put_blob(&digest, body)
                    .await
                    .map_err(map_digest_errors)?;
                observe("blob_put", start);
                return Ok(blob_created(&name, &digest));
            }

            // Chunked upload session
            let session_id = state.registry.start_upload(&name);
            debug!("Started upload {} for {}", session_id, name);

            let mut response = StatusCode::ACCEPTED.into_response();
            let headers = response.headers_mut();
            insert_str(headers, header::LOCATION, &upload_location(&name, &session_id));
            insert_str(headers, header::RANGE, "0-0");
            insert_str(headers, "docker-upload-uuid", &session_id);
            Ok(response)
        }
        _ => Err(ApiError::MethodNotAllowed),
    }
}

// ==================== PATCH ====================

async fn handle_patch(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::Upload { name, session_id } => {
            debug!("PATCH upload: {} ({} bytes)", session_id, body.len());
            let offset = state
                .registry
                .append_upload(&session_id, &body)
                .map_err(|e| match e {
                    CoreError::NotFound(_) => {
                        ApiError::NotFound(format!("Upload session: {}", session_id))
                    }
                    other => ApiError::Core(other),
                })?;

            let mut response = StatusCode::ACCEPTED.into_response();
            let headers = response.headers_mut();
            insert_str(headers, header::LOCATION, &upload_location(&name, &session_id));
            insert_str(headers, header::RANGE, &range_header(offset));
            insert_str(headers, "docker-upload-uuid", &session_id);
            Ok(response)
        }
        _ => Err(ApiError::MethodNotAllowed),
    }
}

// ==================== DELETE ====================

async fn handle_delete(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::Manifest { name, reference } => {
            validate_name(&name)?;
            validate_reference(&reference)?;
            debug!("DELETE manifest: {}:{}", name, reference);

            if state.registry.delete_manifest(&name, &reference).await? {
                Ok(StatusCode::ACCEPTED.into_response())
            } else {
                Err(ApiError::ManifestUnknown(format!("{}:{}", name, reference)))
            }
        }
        RegistryRequest::Blob { name, digest } => {
            validate_name(&name)?;
            validate_digest(&digest)?;
            debug!("DELETE blob: {}", digest);

            if state.registry.delete_blob(&digest).await? {
                Ok(StatusCode::ACCEPTED.into_response())
            } else {
                Err(ApiError::BlobUnknown(digest))
            }
        }
        RegistryRequest::Upload { session_id, .. } => {
            debug!("DELETE upload: {}", session_id);
            if state.registry.cancel_upload(&session_id)? {
                Ok(StatusCode::NO_CONTENT.into_response())
            } else {
                Err(ApiError::NotFound(format!("Upload session: {}", session_id)))
            }
        }
        _ => Err(ApiError::MethodNotAllowed),
    }
}

// ==================== Helpers ====================

/// Apply `?n` / `?last` pagination to a sorted listing.
///
/// `last` elides entries up to and including the named entry; `n` caps the
/// result (zero yields an empty list, not an error).
fn paginate(items: Vec<String>, n: Option<usize>, last: Option<&str>) -> Vec<String> {
    let mut result: Vec<String> = match last {
        Some(last) => items.into_iter().filter(|i| i.as_str() > last).collect(),
        None => items,
    };
    if let Some(n) = n {
        result.truncate(n);
    }
    result
}

/// Content type echoed from the manifest body, defaulting to OCI v1.
fn manifest_media_type(content: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(content)
        .ok()
        .and_then(|v| {
            v.get("mediaType")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_MANIFEST_TYPE.to_string())
}

fn upload_location(name: &str, session_id: &str) -> String {
    format!("/v2/{}/blobs/uploads/{}", name, session_id)
}

/// `Range` header for an upload session at the given offset.
fn range_header(offset: u64) -> String {
    format!("0-{}", offset.saturating_sub(1))
}

fn blob_created(name: &str, digest: &str) -> Response {
    let mut response = StatusCode::CREATED.into_response();
    let headers = response.headers_mut();
    insert_str(
        headers,
        header::LOCATION,
        &format!("/v2/{}/blobs/{}", name, digest),
    );
    insert_str(headers, "docker-content-digest", digest);
    response
}

fn insert_str<K>(headers: &mut axum::http::HeaderMap, key: K, value: &str)
where
    K: axum::http::header::IntoHeaderName,
{
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(key, value);
    }
}

fn map_digest_errors(e: CoreError) -> ApiError {
    match e {
        CoreError::Storage(StorageError::DigestMismatch { expected, actual }) => {
            ApiError::DigestInvalid(format!("expected {}, got {}", expected, actual))
        }
        CoreError::Storage(StorageError::InvalidDigest(msg)) => ApiError::DigestInvalid(msg),
        CoreError::NotFound(msg) => ApiError::NotFound(msg),
        other => ApiError::Core(other),
    }
}

fn observe(class: &'static str, start: Instant) {
    metrics::counter!("repo_worker_requests_total", "class" => class).increment(1);
    metrics::histogram!("repo_worker_request_duration_seconds", "class" => class)
        .record(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_paths() {
        match parse_registry_path("library/alpine/manifests/latest") {
            Some(RegistryRequest::Manifest { name, reference }) => {
                assert_eq!(name, "library/alpine");
                assert_eq!(reference, "latest");
            }
            _ => panic!("expected manifest request"),
        }
    }

    #[test]
    fn parses_blob_and_upload_paths() {
        match parse_registry_path("myrepo/blobs/sha256:abc") {
            Some(RegistryRequest::Blob { name, digest }) => {
                assert_eq!(name, "myrepo");
                assert_eq!(digest, "sha256:abc");
            }
            _ => panic!("expected blob request"),
        }

        assert!(matches!(
            parse_registry_path("myrepo/blobs/uploads/"),
            Some(RegistryRequest::StartUpload { .. })
        ));

        match parse_registry_path("a/b/blobs/uploads/123e4567-e89b-12d3-a456-426614174000") {
            Some(RegistryRequest::Upload { name, session_id }) => {
                assert_eq!(name, "a/b");
                assert_eq!(session_id, "123e4567-e89b-12d3-a456-426614174000");
            }
            _ => panic!("expected upload request"),
        }
    }

    #[test]
    fn parses_list_paths() {
        assert!(matches!(
            parse_registry_path("_catalog"),
            Some(RegistryRequest::Catalog)
        ));
        match parse_registry_path("dockerhub/library/nginx/tags/list") {
            Some(RegistryRequest::TagsList { name }) => {
                assert_eq!(name, "dockerhub/library/nginx");
            }
            _ => panic!("expected tags list"),
        }
        assert!(parse_registry_path("garbage").is_none());
    }

    #[test]
    fn pagination_caps_and_elides() {
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];

        assert_eq!(paginate(items.clone(), None, None).len(), 4);
        assert_eq!(paginate(items.clone(), Some(2), None), vec!["a", "b"]);
        assert_eq!(paginate(items.clone(), None, Some("b")), vec!["c", "d"]);
        assert_eq!(paginate(items.clone(), Some(1), Some("a")), vec!["b"]);
        assert!(paginate(items.clone(), Some(0), None).is_empty());
        assert!(paginate(items, None, Some("z")).is_empty());
    }

    #[test]
    fn media_type_echoed_or_defaulted() {
        let docker = serde_json::to_vec(&serde_json::json!({
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json"
        }))
        .unwrap();
        assert_eq!(
            manifest_media_type(&docker),
            "application/vnd.docker.distribution.manifest.v2+json"
        );
        assert_eq!(manifest_media_type(b"{}"), DEFAULT_MANIFEST_TYPE);
        assert_eq!(manifest_media_type(b"not json"), DEFAULT_MANIFEST_TYPE);
    }

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(range_header(0), "0-0");
        assert_eq!(range_header(1), "0-0");
        assert_eq!(range_header(100), "0-99");
    }
}
