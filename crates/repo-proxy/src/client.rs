//! Upstream registry client
//!
//! One client per configured upstream. Handles the Docker token exchange
//! (401 -> WWW-Authenticate -> token endpoint -> retry once) and retries
//! transient failures with exponential backoff.

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use parking_lot::RwLock;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

use crate::challenge::parse_bearer_challenge;
use crate::error::ProxyError;

/// Type alias for a boxed stream of bytes from an upstream
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// Total deadline for any single upstream call.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts for transient (5xx / network) failures.
const MAX_ATTEMPTS: u32 = 3;

/// Accept header sent on every manifest request: Docker v2 and OCI v1,
/// manifest and index media types.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Authentication mode for an upstream registry.
#[derive(Debug, Clone, Default)]
pub enum UpstreamAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    /// Static bearer token sent as-is.
    Token(String),
}

/// Upstream client configuration
#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    /// Short name this upstream is addressed by (e.g. "dockerhub")
    pub name: String,
    /// Base URL of the registry (e.g. "https://registry-1.docker.io")
    pub url: String,
    /// Authentication mode
    pub auth: UpstreamAuth,
}

/// Manifest fetched from an upstream registry.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub content: Bytes,
    /// Digest as reported by the upstream; empty when the header was absent.
    pub digest: String,
    pub content_type: String,
}

/// Client for a single upstream registry.
pub struct UpstreamClient {
    name: String,
    url: String,
    auth: UpstreamAuth,
    client: Client,
    /// Short-lived bearer tokens keyed by "(service, scope)".
    tokens: RwLock<HashMap<String, String>>,
    /// Service value learned from the first challenge, used to predict
    /// cache keys for subsequent requests.
    service: RwLock<Option<String>>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, ProxyError> {
        let client = Client::builder().timeout(UPSTREAM_TIMEOUT).build()?;

        debug!("Created upstream client for {} ({})", config.name, config.url);

        Ok(Self {
            name: config.name,
            url: config.url.trim_end_matches('/').to_string(),
            auth: config.auth,
            client,
            tokens: RwLock::new(HashMap::new()),
            service: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if a manifest exists and return its digest.
    pub async fn head_manifest(
        &self,
        image: &str,
        reference: &str,
    ) -> Result<Option<String>, ProxyError> {
        let url = format!("{}/v2/{}/manifests/{}", self.url, image, reference);
        let response = self
            .execute(Method::HEAD, &url, Some(MANIFEST_ACCEPT), image)
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(response
                .headers()
                .get("docker-content-digest")
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)),
            status => Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                message: format!("HEAD {}", url),
            }),
        }
    }

    /// Fetch a manifest by tag or digest.
    pub async fn get_manifest(
        &self,
        image: &str,
        reference: &str,
    ) -> Result<ManifestResponse, ProxyError> {
        let url = format!("{}/v2/{}/manifests/{}", self.url, image, reference);
        debug!("Fetching manifest: {}", url);

        let response = self
            .execute(Method::GET, &url, Some(MANIFEST_ACCEPT), image)
            .await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(ProxyError::NotFound(format!("{}:{}", image, reference)));
        }
        if !status.is_success() {
            return Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .to_string();

        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        let content = response.bytes().await?;

        Ok(ManifestResponse {
            content,
            digest,
            content_type,
        })
    }

    /// Fetch a blob as a stream together with its size (0 when unknown).
    pub async fn get_blob(
        &self,
        image: &str,
        digest: &str,
    ) -> Result<(ByteStream, u64), ProxyError> {
        let url = format!("{}/v2/{}/blobs/{}", self.url, image, digest);
        debug!("Fetching blob: {}", url);

        let response = self.execute(Method::GET, &url, None, image).await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(ProxyError::NotFound(digest.to_string()));
        }
        if !status.is_success() {
            return Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let size = response
            .headers()
            .get("content-length")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let stream = response
            .bytes_stream()
            .map_err(ProxyError::Http);

        Ok((Box::pin(stream), size))
    }

    // ==================== Request plumbing ====================

    /// Execute a request, retrying transient failures with exponential
    /// backoff and resolving 401 challenges at most once per attempt.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        image: &str,
    ) -> Result<Response, ProxyError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.try_authorized(method.clone(), url, accept, image).await;

            let transient = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(ProxyError::Http(e)) => e.is_timeout() || e.is_connect() || e.is_request(),
                Err(_) => false,
            };

            if transient && attempt < MAX_ATTEMPTS {
                let delay = Duration::from_millis(250 * (1 << attempt));
                warn!(
                    "Transient upstream failure for {} (attempt {}/{}), retrying in {:?}",
                    url, attempt, MAX_ATTEMPTS, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return result;
        }
    }

    /// Send one request, performing the token-exchange dance on 401.
    async fn try_authorized(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        image: &str,
    ) -> Result<Response, ProxyError> {
        let response = self
            .build_request(method.clone(), url, accept, self.cached_auth_header(image))
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let www_authenticate = response
            .headers()
            .get("www-authenticate")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        let challenge = www_authenticate
            .as_deref()
            .and_then(parse_bearer_challenge)
            .ok_or(ProxyError::Unauthorized)?;

        let token = self.fetch_token(&challenge).await?;

        let retry = self
            .build_request(method, url, accept, Some(format!("Bearer {}", token)))
            .send()
            .await?;

        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(ProxyError::Unauthorized);
        }

        Ok(retry)
    }

    fn build_request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        authorization: Option<String>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(accept) = accept {
            request = request.header("Accept", accept);
        }
        if let Some(authorization) = authorization {
            request = request.header("Authorization", authorization);
        }
        request
    }

    /// Authorization header to attach before any challenge has been seen.
    fn cached_auth_header(&self, image: &str) -> Option<String> {
        match &self.auth {
            UpstreamAuth::Basic { username, password } => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                return Some(format!("Basic {}", encoded));
            }
            UpstreamAuth::Token(token) => return Some(format!("Bearer {}", token)),
            UpstreamAuth::None => {}
        }

        // Predict the cache key from the service seen on earlier challenges.
        let service = self.service.read().clone()?;
        let key = token_key(&service, &format!("repository:{}:pull", image));
        self.tokens.read().get(&key).map(|t| format!("Bearer {}", t))
    }

    /// Resolve a bearer challenge at the token endpoint and cache the result.
    async fn fetch_token(
        &self,
        challenge: &crate::challenge::BearerChallenge,
    ) -> Result<String, ProxyError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let url = challenge.token_url();
        debug!("Fetching token from: {}", url);

        let mut request = self.client.get(&url);
        if let UpstreamAuth::Basic { username, password } = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProxyError::TokenRefreshFailed);
        }

        let body: TokenResponse = response.json().await?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or(ProxyError::TokenRefreshFailed)?;

        if let Some(service) = &challenge.service {
            *self.service.write() = Some(service.clone());
            let key = token_key(service, challenge.scope.as_deref().unwrap_or(""));
            self.tokens.write().insert(key, token.clone());
        }

        Ok(token)
    }
}

fn token_key(service: &str, scope: &str) -> String {
    format!("{}|{}", service, scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_for_each_auth_mode() {
        for auth in [
            UpstreamAuth::None,
            UpstreamAuth::Basic {
                username: "u".to_string(),
                password: "p".to_string(),
            },
            UpstreamAuth::Token("t".to_string()),
        ] {
            let client = UpstreamClient::new(UpstreamClientConfig {
                name: "dockerhub".to_string(),
                url: "https://registry-1.docker.io/".to_string(),
                auth,
            })
            .unwrap();
            assert_eq!(client.name(), "dockerhub");
            // trailing slash is normalized away
            assert_eq!(client.url, "https://registry-1.docker.io");
        }
    }

    #[test]
    fn static_auth_headers() {
        let basic = UpstreamClient::new(UpstreamClientConfig {
            name: "up".to_string(),
            url: "https://r.example".to_string(),
            auth: UpstreamAuth::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            },
        })
        .unwrap();
        assert_eq!(
            basic.cached_auth_header("library/nginx").as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );

        let token = UpstreamClient::new(UpstreamClientConfig {
            name: "up".to_string(),
            url: "https://r.example".to_string(),
            auth: UpstreamAuth::Token("abc".to_string()),
        })
        .unwrap();
        assert_eq!(
            token.cached_auth_header("library/nginx").as_deref(),
            Some("Bearer abc")
        );
    }

    #[test]
    fn anonymous_auth_starts_without_header() {
        let client = UpstreamClient::new(UpstreamClientConfig {
            name: "dockerhub".to_string(),
            url: "https://registry-1.docker.io".to_string(),
            auth: UpstreamAuth::None,
        })
        .unwrap();
        assert!(client.cached_auth_header("library/nginx").is_none());
    }

    #[test]
    fn cached_token_is_predicted_by_service_and_scope() {
        let client = UpstreamClient::new(UpstreamClientConfig {
            name: "dockerhub".to_string(),
            url: "https://registry-1.docker.io".to_string(),
            auth: UpstreamAuth::None,
        })
        .unwrap();

        *client.service.write() = Some("registry.docker.io".to_string());
        client.tokens.write().insert(
            token_key("registry.docker.io", "repository:library/nginx:pull"),
            "cached-token".to_string(),
        );

        assert_eq!(
            client.cached_auth_header("library/nginx").as_deref(),
            Some("Bearer cached-token")
        );
        assert!(client.cached_auth_header("library/alpine").is_none());
    }
}
