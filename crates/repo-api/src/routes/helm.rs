//! Helm chart repository routes

use axum::{
    Json, Router,
    extract::{Multipart, Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;
use repo_core::CoreError;

/// Create Helm routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/index.yaml", get(get_index))
        .route("/charts/{filename}", get(download_chart))
        .route("/api/v1/charts", post(upload_chart).get(list_charts))
        .route("/api/v1/charts/{name}/{version}", axum::routing::delete(delete_chart))
}

/// GET /index.yaml - repository index derived from stored tarballs
async fn get_index(State(state): State<AppState>) -> Result<Response, ApiError> {
    let index = state.helm.index().await?;
    let yaml = serde_yaml::to_string(&index)
        .map_err(|e| ApiError::Core(CoreError::BadRequest(format!("index render: {}", e))))?;

    let mut response = (StatusCode::OK, yaml).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-yaml"),
    );
    Ok(response)
}

/// GET /charts/{name}-{version}.tgz - download a stored chart
async fn download_chart(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let (name, version) =
        parse_chart_filename(&filename).ok_or_else(|| ApiError::NotFound(filename.clone()))?;

    debug!("Downloading chart {}-{}", name, version);

    let content = state
        .helm
        .download(&name, &version)
        .await
        .map_err(|e| match e {
            CoreError::NotFound(_) => ApiError::NotFound(filename.clone()),
            other => ApiError::Core(other),
        })?;

    let mut response = (StatusCode::OK, content).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/gzip"),
    );
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// POST /api/v1/charts - multipart chart upload
async fn upload_chart(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut content = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("unreadable multipart field: {}", e)))?;
        if !bytes.is_empty() {
            content = Some(bytes);
            break;
        }
    }

    let content = content.ok_or_else(|| ApiError::BadRequest("no chart uploaded".to_string()))?;

    let (name, version) = state.helm.upload(content).await.map_err(|e| match e {
        CoreError::BadRequest(msg) => ApiError::BadRequest(msg),
        other => ApiError::Core(other),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "saved": true, "name": name, "version": version })),
    )
        .into_response())
}

/// GET /api/v1/charts - list stored charts
async fn list_charts(State(state): State<AppState>) -> Result<Response, ApiError> {
    let charts: Vec<_> = state
        .helm
        .list()
        .await?
        .into_iter()
        .map(|(name, version)| json!({ "name": name, "version": version }))
        .collect();
    Ok(Json(json!(charts)).into_response())
}

/// DELETE /api/v1/charts/{name}/{version}
async fn delete_chart(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if state.helm.delete(&name, &version).await? {
        Ok(Json(json!({ "deleted": true })).into_response())
    } else {
        Err(ApiError::NotFound(format!("chart {}-{}", name, version)))
    }
}

/// Split `<name>-<version>.tgz` into name and version.
///
/// Chart names may contain dashes, so the version starts at the last dash
/// followed by a digit.
fn parse_chart_filename(filename: &str) -> Option<(String, String)> {
    let stem = filename.strip_suffix(".tgz")?;
    let bytes = stem.as_bytes();

    let split = (0..bytes.len())
        .rev()
        .find(|&i| bytes[i] == b'-' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit))?;

    if split == 0 {
        return None;
    }

    Some((stem[..split].to_string(), stem[split + 1..].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_filenames() {
        assert_eq!(
            parse_chart_filename("foo-1.0.0.tgz"),
            Some(("foo".to_string(), "1.0.0".to_string()))
        );
    }

    #[test]
    fn splits_dashed_chart_names() {
        assert_eq!(
            parse_chart_filename("my-chart-1.2.3.tgz"),
            Some(("my-chart".to_string(), "1.2.3".to_string()))
        );
        assert_eq!(
            parse_chart_filename("ingress-nginx-4.10.0-beta.1.tgz"),
            Some(("ingress-nginx".to_string(), "4.10.0-beta.1".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_filenames() {
        assert_eq!(parse_chart_filename("foo.tar.gz"), None);
        assert_eq!(parse_chart_filename("noversion.tgz"), None);
        assert_eq!(parse_chart_filename("-1.0.0.tgz"), None);
    }
}
