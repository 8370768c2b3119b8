//! Pull-through cache state
//!
//! Proxied manifests live under the internal `_proxy/<upstream>/<image>`
//! repository prefix; one cache-metadata document exists per
//! (upstream, image, tag). Blobs are content-addressed and shared with
//! locally pushed content.

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use repo_storage::{CacheMeta, S3Store, StorageError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::CoreError;
use crate::pattern::TagMatcher;

/// Cache manager for proxied manifests and their metadata.
pub struct CacheManager {
    storage: Arc<S3Store>,
    mutable_tags: TagMatcher,
    /// In-flight background refresh tasks keyed by "upstream/image:tag".
    revalidations: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CacheManager {
    pub fn new(storage: Arc<S3Store>, mutable_tags: TagMatcher) -> Self {
        Self {
            storage,
            mutable_tags,
            revalidations: Mutex::new(HashMap::new()),
        }
    }

    /// Internal repository name holding cached manifests for an upstream image.
    pub fn proxy_repo(upstream: &str, image: &str) -> String {
        format!("_proxy/{}/{}", upstream, image)
    }

    fn flight_key(upstream: &str, image: &str, tag: &str) -> String {
        format!("{}/{}:{}", upstream, image, tag)
    }

    /// Classify a tag. Digest references are never mutable.
    pub fn is_mutable_tag(&self, reference: &str) -> bool {
        !repo_storage::is_digest(reference) && self.mutable_tags.matches(reference)
    }

    /// Get a cached manifest, or None on a cache miss.
    pub async fn get_cached_manifest(
        &self,
        upstream: &str,
        image: &str,
        reference: &str,
    ) -> Result<Option<(Bytes, String)>, CoreError> {
        let repo = Self::proxy_repo(upstream, image);
        match self.storage.get_manifest(&repo, reference).await {
            Ok(found) => Ok(Some(found)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get cache metadata for a tag, or None when never cached.
    pub async fn get_meta(
        &self,
        upstream: &str,
        image: &str,
        tag: &str,
    ) -> Result<Option<CacheMeta>, CoreError> {
        Ok(self.storage.get_cache_meta(upstream, image, tag).await?)
    }

    /// Cache a manifest fetched from upstream.
    ///
    /// Content is written before metadata so a reader that observes the
    /// metadata document always finds the manifest. The mutability of an
    /// existing entry is preserved; a new entry is classified from the
    /// configured patterns.
    pub async fn put_cached_manifest(
        &self,
        upstream: &str,
        image: &str,
        reference: &str,
        content: Bytes,
    ) -> Result<String, CoreError> {
        let repo = Self::proxy_repo(upstream, image);
        let digest = self.storage.put_manifest(&repo, reference, content).await?;

        if !repo_storage::is_digest(reference) {
            let mutable = match self.storage.get_cache_meta(upstream, image, reference).await? {
                Some(existing) => existing.mutable,
                None => self.mutable_tags.matches(reference),
            };
            let now = Utc::now().timestamp();
            self.storage
                .put_cache_meta(
                    upstream,
                    image,
                    reference,
                    &CacheMeta {
                        digest: digest.clone(),
                        mutable,
                        last_check_epoch: now,
                        last_updated_epoch: now,
                    },
                )
                .await?;
        }

        Ok(digest)
    }

    /// Record a revalidation that found the cached digest still current.
    pub async fn touch_check(
        &self,
        upstream: &str,
        image: &str,
        tag: &str,
    ) -> Result<(), CoreError> {
        if let Some(mut meta) = self.storage.get_cache_meta(upstream, image, tag).await? {
            meta.last_check_epoch = Utc::now().timestamp();
            self.storage.put_cache_meta(upstream, image, tag, &meta).await?;
        }
        Ok(())
    }

    // ==================== Single-flight refresh ====================

    /// Check whether a refresh is already in flight for this tuple.
    pub fn is_revalidating(&self, upstream: &str, image: &str, tag: &str) -> bool {
        let key = Self::flight_key(upstream, image, tag);
        let tasks = self.revalidations.lock();
        tasks.get(&key).is_some_and(|t| !t.is_finished())
    }

    /// Start a background refresh unless one is already running for the
    /// tuple. A duplicate request is silently dropped.
    pub fn start_revalidation(
        self: &Arc<Self>,
        upstream: &str,
        image: &str,
        tag: &str,
        refresh: impl Future<Output = ()> + Send + 'static,
    ) {
        let key = Self::flight_key(upstream, image, tag);

        let mut tasks = self.revalidations.lock();
        if tasks.get(&key).is_some_and(|t| !t.is_finished()) {
            return;
        }

        let manager = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            refresh.await;
            manager.revalidations.lock().remove(&task_key);
        });
        tasks.insert(key, handle);
    }

    /// Abort all in-flight refresh tasks. Called on shutdown; an aborted
    /// refresh releases its slot without writing metadata.
    pub fn cancel_revalidations(&self) {
        let mut tasks = self.revalidations.lock();
        for (key, handle) in tasks.drain() {
            debug!("Cancelling background refresh for {}", key);
            handle.abort();
        }
    }

    // ==================== Blob cache ====================

    /// Check if a blob is cached. Blobs are cached forever.
    pub async fn blob_exists(&self, digest: &str) -> Result<bool, CoreError> {
        Ok(self.storage.blob_exists(digest).await?)
    }

    /// Cache a blob from an upstream stream, verifying its digest.
    pub async fn put_cached_blob(
        &self,
        digest: &str,
        stream: repo_proxy::ByteStream,
    ) -> Result<(), CoreError> {
        use futures::TryStreamExt;
        let mapped: repo_storage::ByteStream = Box::pin(
            stream.map_err(|e| StorageError::Backend(format!("upstream stream: {}", e))),
        );
        match self.storage.put_blob_stream(digest, mapped).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Failed to cache blob {}: {}", digest, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_storage::S3Config;
    use std::time::Duration;

    fn manager() -> Arc<CacheManager> {
        let storage = Arc::new(
            S3Store::new(S3Config {
                access_key: Some("test".to_string()),
                secret_key: Some("test".to_string()),
                ..S3Config::default()
            })
            .unwrap(),
        );
        let patterns = vec!["latest".to_string(), "*nightly*".to_string()];
        Arc::new(CacheManager::new(storage, TagMatcher::new(&patterns)))
    }

    #[test]
    fn proxy_repo_layout() {
        assert_eq!(
            CacheManager::proxy_repo("dockerhub", "library/nginx"),
            "_proxy/dockerhub/library/nginx"
        );
    }

    #[test]
    fn digest_references_are_never_mutable() {
        let m = manager();
        assert!(m.is_mutable_tag("latest"));
        assert!(!m.is_mutable_tag("sha256:0000000000000000000000000000000000000000000000000000000000000000"));
    }

    #[tokio::test]
    async fn single_flight_drops_duplicates() {
        let m = manager();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        m.start_revalidation("dockerhub", "library/nginx", "latest", async move {
            let _ = rx.await;
        });
        assert!(m.is_revalidating("dockerhub", "library/nginx", "latest"));

        // Duplicate while in flight is dropped: the map still holds one task.
        m.start_revalidation("dockerhub", "library/nginx", "latest", async {
            panic!("duplicate refresh must not run");
        });
        assert_eq!(m.revalidations.lock().len(), 1);

        // Independent tuples run concurrently.
        m.start_revalidation("dockerhub", "library/nginx", "stable", async {});
        tx.send(()).unwrap();

        // Both tasks drain and release their slots.
        for _ in 0..50 {
            if m.revalidations.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("revalidation slots were not released");
    }

    #[tokio::test]
    async fn cancel_revalidations_aborts_tasks() {
        let m = manager();
        m.start_revalidation("dockerhub", "library/nginx", "latest", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(m.is_revalidating("dockerhub", "library/nginx", "latest"));
        m.cancel_revalidations();
        assert!(!m.is_revalidating("dockerhub", "library/nginx", "latest"));
    }
}
