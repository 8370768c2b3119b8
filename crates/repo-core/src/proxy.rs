//! Pull-through proxy handler
//!
//! Resolves proxied repository names to an upstream client and serves
//! manifests with a stale-while-revalidate discipline:
//!
//! - digest references are content-addressed and cached forever,
//! - an uncached tag is fetched synchronously,
//! - an immutable cached tag is served without ever revalidating,
//! - a mutable cached tag is served immediately while a background refresh
//!   runs, at most one per (upstream, image, tag).

use bytes::Bytes;
use futures::StreamExt;
use repo_proxy::UpstreamClient;
use repo_storage::{ByteStream, S3Store, compute_sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::CacheManager;
use crate::error::CoreError;

/// Concurrent upstream blob fetches during a background manifest fill.
const BLOB_FETCH_CONCURRENCY: usize = 5;

/// Handles pull-through requests for proxied repository names.
pub struct ProxyHandler {
    storage: Arc<S3Store>,
    cache: Arc<CacheManager>,
    upstreams: HashMap<String, Arc<UpstreamClient>>,
}

impl ProxyHandler {
    pub fn new(
        storage: Arc<S3Store>,
        cache: Arc<CacheManager>,
        clients: Vec<Arc<UpstreamClient>>,
    ) -> Self {
        let upstreams = clients
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            storage,
            cache,
            upstreams,
        }
    }

    fn upstream(&self, name: &str) -> Result<Arc<UpstreamClient>, CoreError> {
        self.upstreams
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownUpstream(name.to_string()))
    }

    /// Resolve a repository name to (upstream, image) when it addresses a
    /// proxied upstream; None means the name is purely local.
    ///
    /// - `dockerhub/library/nginx` -> `(dockerhub, library/nginx)`
    /// - `library/nginx` -> `(dockerhub, library/nginx)`
    /// - `nginx` -> `(dockerhub, library/nginx)`
    pub fn resolve(&self, name: &str) -> Option<(String, String)> {
        if let Some((first, rest)) = name.split_once('/') {
            if self.upstreams.contains_key(first) {
                return Some((first.to_string(), rest.to_string()));
            }
            if first == "library" && self.upstreams.contains_key("dockerhub") {
                return Some(("dockerhub".to_string(), name.to_string()));
            }
            return None;
        }

        // Bare library image, e.g. "alpine"
        if self.upstreams.contains_key("dockerhub") {
            return Some(("dockerhub".to_string(), format!("library/{}", name)));
        }
        None
    }

    /// Get a proxied manifest. Returns (bytes, digest).
    pub async fn get_manifest(
        &self,
        upstream_name: &str,
        image: &str,
        reference: &str,
    ) -> Result<(Bytes, String), CoreError> {
        if repo_storage::is_digest(reference) {
            return self.get_manifest_by_digest(upstream_name, image, reference).await;
        }
        self.get_manifest_by_tag(upstream_name, image, reference).await
    }

    /// Digest pull: content-addressed lookup, fetch-verify-store on miss.
    async fn get_manifest_by_digest(
        &self,
        upstream_name: &str,
        image: &str,
        digest: &str,
    ) -> Result<(Bytes, String), CoreError> {
        if let Some(found) = self
            .cache
            .get_cached_manifest(upstream_name, image, digest)
            .await?
        {
            record_proxy("proxy_hit");
            return Ok(found);
        }

        record_proxy("proxy_miss");
        let upstream = self.upstream(upstream_name)?;
        let result = upstream.get_manifest(image, digest).await.map_err(|e| {
            if matches!(e, repo_proxy::ProxyError::NotFound(_)) {
                CoreError::NotFound(format!("{}/{}@{}", upstream_name, image, digest))
            } else {
                CoreError::Proxy(e)
            }
        })?;

        let computed = compute_sha256(&result.content);
        if computed != digest {
            return Err(CoreError::Proxy(repo_proxy::ProxyError::InvalidResponse(
                format!("upstream digest mismatch: expected {}, got {}", digest, computed),
            )));
        }

        self.cache
            .put_cached_manifest(upstream_name, image, digest, result.content.clone())
            .await?;

        Ok((result.content, digest.to_string()))
    }

    /// Tag pull: stale-while-revalidate.
    async fn get_manifest_by_tag(
        &self,
        upstream_name: &str,
        image: &str,
        tag: &str,
    ) -> Result<(Bytes, String), CoreError> {
        let meta = self.cache.get_meta(upstream_name, image, tag).await?;
        let cached = self
            .cache
            .get_cached_manifest(upstream_name, image, tag)
            .await?;

        if let (Some(meta), Some((content, digest))) = (meta, cached) {
            record_proxy("proxy_hit");

            if meta.mutable && !self.cache.is_revalidating(upstream_name, image, tag) {
                self.schedule_revalidation(upstream_name, image, tag, meta.digest);
            }

            return Ok((content, digest));
        }

        // No usable cache entry: synchronous fetch.
        record_proxy("proxy_miss");
        let upstream = self.upstream(upstream_name)?;
        let result = upstream.get_manifest(image, tag).await.map_err(|e| {
            if matches!(e, repo_proxy::ProxyError::NotFound(_)) {
                CoreError::NotFound(format!("{}/{}:{}", upstream_name, image, tag))
            } else {
                CoreError::Proxy(e)
            }
        })?;

        let digest = self
            .cache
            .put_cached_manifest(upstream_name, image, tag, result.content.clone())
            .await?;

        self.schedule_blob_fill(upstream_name, image, result.content.clone());

        Ok((result.content, digest))
    }

    /// Get a proxied blob, filling the cache on demand.
    ///
    /// Missing blobs are first written to the store (digest-verified) and
    /// then streamed back, so clients never receive unverified bytes.
    pub async fn get_blob(
        &self,
        upstream_name: &str,
        image: &str,
        digest: &str,
    ) -> Result<(ByteStream, u64), CoreError> {
        repo_storage::validate_digest(digest).map_err(CoreError::Storage)?;

        if !self.storage.blob_exists(digest).await? {
            record_proxy("proxy_miss");
            self.fetch_blob(upstream_name, image, digest).await?;
        } else {
            record_proxy("proxy_hit");
        }

        Ok(self.storage.get_blob(digest).await?)
    }

    /// Check a proxied blob, filling the cache when the upstream has it.
    pub async fn blob_size(
        &self,
        upstream_name: &str,
        image: &str,
        digest: &str,
    ) -> Result<Option<u64>, CoreError> {
        if self.storage.blob_exists(digest).await? {
            return Ok(Some(self.storage.blob_size(digest).await?));
        }

        match self.fetch_blob(upstream_name, image, digest).await {
            Ok(()) => Ok(Some(self.storage.blob_size(digest).await?)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_blob(
        &self,
        upstream_name: &str,
        image: &str,
        digest: &str,
    ) -> Result<(), CoreError> {
        let upstream = self.upstream(upstream_name)?;
        debug!("Filling blob cache for {} from {}", digest, upstream_name);

        let (stream, _size) = upstream.get_blob(image, digest).await.map_err(|e| {
            if matches!(e, repo_proxy::ProxyError::NotFound(_)) {
                CoreError::NotFound(digest.to_string())
            } else {
                CoreError::Proxy(e)
            }
        })?;

        self.cache.put_cached_blob(digest, stream).await
    }

    // ==================== Background refresh ====================

    fn schedule_revalidation(
        &self,
        upstream_name: &str,
        image: &str,
        tag: &str,
        cached_digest: String,
    ) {
        let Ok(upstream) = self.upstream(upstream_name) else {
            return;
        };

        let cache = Arc::clone(&self.cache);
        let upstream_owned = upstream_name.to_string();
        let image_owned = image.to_string();
        let tag_owned = tag.to_string();

        record_proxy("proxy_revalidate");

        self.cache.start_revalidation(upstream_name, image, tag, async move {
            if let Err(e) = revalidate(
                cache,
                upstream,
                &upstream_owned,
                &image_owned,
                &tag_owned,
                &cached_digest,
            )
            .await
            {
                // Refresh errors never invalidate the cached entry.
                error!(
                    "Revalidation error for {}/{}:{}: {}",
                    upstream_owned, image_owned, tag_owned, e
                );
            }
        });
    }

    /// Spawn background caching of the blobs a freshly fetched manifest
    /// references. Fire-and-forget: failures leave the manifest valid and
    /// the blobs to be fetched on demand.
    fn schedule_blob_fill(&self, upstream_name: &str, image: &str, manifest: Bytes) {
        let Ok(upstream) = self.upstream(upstream_name) else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        let image = image.to_string();

        tokio::spawn(async move {
            cache_manifest_blobs(cache, upstream, &image, &manifest).await;
        });
    }
}

/// Background refresh for a mutable tag: HEAD upstream, refetch only when
/// the digest moved, then fill new blobs.
async fn revalidate(
    cache: Arc<CacheManager>,
    upstream: Arc<UpstreamClient>,
    upstream_name: &str,
    image: &str,
    tag: &str,
    cached_digest: &str,
) -> Result<(), CoreError> {
    debug!("Revalidating {}/{}:{}", upstream_name, image, tag);

    let current = upstream.head_manifest(image, tag).await?;

    match current {
        Some(digest) if digest != cached_digest => {
            info!(
                "Updating cache for {}/{}:{} ({} -> {})",
                upstream_name, image, tag, cached_digest, digest
            );

            let result = upstream.get_manifest(image, tag).await?;
            cache
                .put_cached_manifest(upstream_name, image, tag, result.content.clone())
                .await?;

            cache_manifest_blobs(Arc::clone(&cache), upstream, image, &result.content).await;
        }
        _ => {
            cache.touch_check(upstream_name, image, tag).await?;
            debug!("Cache still valid for {}/{}:{}", upstream_name, image, tag);
        }
    }

    Ok(())
}

/// Digests referenced by a manifest: config plus layers.
fn manifest_blob_digests(manifest: &[u8]) -> Vec<String> {
    let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(manifest) else {
        return Vec::new();
    };

    let mut digests = Vec::new();
    if let Some(digest) = parsed
        .get("config")
        .and_then(|c| c.get("digest"))
        .and_then(|d| d.as_str())
    {
        digests.push(digest.to_string());
    }
    if let Some(layers) = parsed.get("layers").and_then(|l| l.as_array()) {
        for layer in layers {
            if let Some(digest) = layer.get("digest").and_then(|d| d.as_str()) {
                digests.push(digest.to_string());
            }
        }
    }
    digests
}

/// Fetch the blobs a manifest references, bounded by a small semaphore.
/// Individual failures are tolerated.
async fn cache_manifest_blobs(
    cache: Arc<CacheManager>,
    upstream: Arc<UpstreamClient>,
    image: &str,
    manifest: &[u8],
) {
    let digests = manifest_blob_digests(manifest);
    if digests.is_empty() {
        return;
    }

    let semaphore = Arc::new(Semaphore::new(BLOB_FETCH_CONCURRENCY));
    let mut tasks = futures::stream::FuturesUnordered::new();

    for digest in digests {
        let cache = Arc::clone(&cache);
        let upstream = Arc::clone(&upstream);
        let semaphore = Arc::clone(&semaphore);
        let image = image.to_string();

        tasks.push(async move {
            let _permit = semaphore.acquire().await;

            match cache.blob_exists(&digest).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    warn!("Blob existence check failed for {}: {}", digest, e);
                    return;
                }
            }

            match upstream.get_blob(&image, &digest).await {
                Ok((stream, _size)) => {
                    if let Err(e) = cache.put_cached_blob(&digest, stream).await {
                        warn!("Background blob cache failed for {}: {}", digest, e);
                    }
                }
                Err(e) => warn!("Background blob fetch failed for {}: {}", digest, e),
            }
        });
    }

    while tasks.next().await.is_some() {}
}

fn record_proxy(class: &'static str) {
    metrics::counter!("repo_worker_requests_total", "class" => class).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::TagMatcher;
    use repo_proxy::{UpstreamAuth, UpstreamClientConfig};
    use repo_storage::S3Config;

    fn handler(upstreams: &[&str]) -> ProxyHandler {
        let storage = Arc::new(
            S3Store::new(S3Config {
                access_key: Some("test".to_string()),
                secret_key: Some("test".to_string()),
                ..S3Config::default()
            })
            .unwrap(),
        );
        let patterns = vec!["latest".to_string()];
        let cache = Arc::new(CacheManager::new(
            Arc::clone(&storage),
            TagMatcher::new(&patterns),
        ));
        let clients = upstreams
            .iter()
            .map(|name| {
                Arc::new(
                    UpstreamClient::new(UpstreamClientConfig {
                        name: name.to_string(),
                        url: format!("https://{}.example", name),
                        auth: UpstreamAuth::None,
                    })
                    .unwrap(),
                )
            })
            .collect();
        ProxyHandler::new(storage, cache, clients)
    }

    #[test]
    fn resolves_reserved_first_component() {
        let h = handler(&["dockerhub", "ghcr"]);
        assert_eq!(
            h.resolve("dockerhub/library/nginx"),
            Some(("dockerhub".to_string(), "library/nginx".to_string()))
        );
        assert_eq!(
            h.resolve("ghcr/owner/repo"),
            Some(("ghcr".to_string(), "owner/repo".to_string()))
        );
    }

    #[test]
    fn resolves_bare_library_images_to_dockerhub() {
        let h = handler(&["dockerhub"]);
        assert_eq!(
            h.resolve("nginx"),
            Some(("dockerhub".to_string(), "library/nginx".to_string()))
        );
        assert_eq!(
            h.resolve("library/nginx"),
            Some(("dockerhub".to_string(), "library/nginx".to_string()))
        );
    }

    #[test]
    fn local_names_are_not_proxied() {
        let h = handler(&["dockerhub"]);
        assert_eq!(h.resolve("myteam/app"), None);
        assert_eq!(h.resolve("internal/tools/builder"), None);
    }

    #[test]
    fn bare_names_stay_local_without_dockerhub() {
        let h = handler(&["ghcr"]);
        assert_eq!(h.resolve("nginx"), None);
        assert_eq!(h.resolve("library/nginx"), None);
    }

    #[test]
    fn extracts_config_and_layer_digests() {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {"digest": "sha256:aaa", "size": 7},
            "layers": [
                {"digest": "sha256:bbb", "size": 100},
                {"digest": "sha256:ccc", "size": 200},
            ]
        });
        let digests = manifest_blob_digests(&serde_json::to_vec(&manifest).unwrap());
        assert_eq!(digests, vec!["sha256:aaa", "sha256:bbb", "sha256:ccc"]);
    }

    #[test]
    fn manifest_index_has_no_blobs() {
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{"digest": "sha256:aaa"}]
        });
        assert!(manifest_blob_digests(&serde_json::to_vec(&index).unwrap()).is_empty());
    }

    #[test]
    fn malformed_manifest_yields_no_digests() {
        assert!(manifest_blob_digests(b"not-json").is_empty());
    }
}
