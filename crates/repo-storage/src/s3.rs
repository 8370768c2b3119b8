//! S3-compatible object-store adapter
//!
//! Uses the `object_store` crate against AWS S3, MinIO, or any other
//! S3-compatible service. The key layout is fixed and shared with other
//! deployments reading the same bucket:
//!
//! ```text
//! blobs/<algo>/<first-2-hex>/<full-hex>
//! repositories/<name>/_manifests/revisions/<digest>/content
//! repositories/<name>/_manifests/tags/<tag>/link
//! charts/<chart>/<chart>-<version>.tgz
//! cache/<upstream>/<image>/<tag>/meta.json
//! ```

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::digest::{DigestHasher, compute_sha256, is_digest, parse_digest};
use crate::error::StorageError;

/// Type alias for a boxed stream of bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Minimum part size accepted by S3 multipart uploads (except the last part).
const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3 storage configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,
    /// Region (e.g., "us-east-1")
    pub region: String,
    /// Endpoint URL (for MinIO or other S3-compatible services)
    pub endpoint: Option<String>,
    /// Access key ID
    pub access_key: Option<String>,
    /// Secret access key
    pub secret_key: Option<String>,
    /// Allow plain-HTTP endpoints
    pub allow_http: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "repository".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            allow_http: false,
        }
    }
}

/// Cache-metadata document for one (upstream, image, tag) tuple.
///
/// `mutable` is derived from the tag patterns at first write and never
/// changes for an existing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub digest: String,
    pub mutable: bool,
    pub last_check_epoch: i64,
    pub last_updated_epoch: i64,
}

/// Object-store adapter owning all durable state keys.
pub struct S3Store {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl S3Store {
    /// Create a new adapter from configuration.
    pub fn new(config: S3Config) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(access_key) = &config.access_key {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = &config.secret_key {
            builder = builder.with_secret_access_key(secret_key);
        }
        if config.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder.build().map_err(|e| {
            StorageError::Configuration(format!("Failed to create S3 client: {}", e))
        })?;

        info!(
            "Initialized S3 storage: bucket={}, region={}, endpoint={:?}",
            config.bucket, config.region, config.endpoint
        );

        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket,
        })
    }

    /// Verify the configured bucket is reachable.
    ///
    /// `object_store` cannot create buckets, so this probes with a bounded
    /// listing. Used both at startup (fatal on failure) and by the
    /// readiness endpoint.
    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        let mut listing = self.store.list(None);
        match listing.next().await {
            None | Some(Ok(_)) => Ok(()),
            Some(Err(object_store::Error::NotFound { .. })) => Ok(()),
            Some(Err(e)) => Err(StorageError::S3(format!(
                "bucket '{}' unreachable: {}",
                self.bucket, e
            ))),
        }
    }

    // ==================== Key layout ====================

    fn blob_path(&self, digest: &str) -> Result<ObjectPath, StorageError> {
        let (algorithm, hash) = parse_digest(digest)?;
        let shard = &hash[..2];
        Ok(ObjectPath::from(format!(
            "blobs/{}/{}/{}",
            algorithm, shard, hash
        )))
    }

    fn manifest_revision_path(&self, name: &str, digest: &str) -> ObjectPath {
        ObjectPath::from(format!(
            "repositories/{}/_manifests/revisions/{}/content",
            name, digest
        ))
    }

    fn tag_link_path(&self, name: &str, tag: &str) -> ObjectPath {
        ObjectPath::from(format!("repositories/{}/_manifests/tags/{}/link", name, tag))
    }

    fn chart_path(&self, name: &str, version: &str) -> ObjectPath {
        ObjectPath::from(format!("charts/{}/{}-{}.tgz", name, name, version))
    }

    fn cache_meta_path(&self, upstream: &str, image: &str, tag: &str) -> ObjectPath {
        ObjectPath::from(format!("cache/{}/{}/{}/meta.json", upstream, image, tag))
    }

    // ==================== Raw object helpers ====================

    async fn get_object(&self, path: &ObjectPath) -> Result<Bytes, StorageError> {
        let result = self.store.get(path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(path.to_string()),
            _ => StorageError::S3(e.to_string()),
        })?;

        result
            .bytes()
            .await
            .map_err(|e| StorageError::S3(format!("Failed to read bytes: {}", e)))
    }

    async fn put_object(&self, path: &ObjectPath, data: Bytes) -> Result<(), StorageError> {
        self.store
            .put(path, PutPayload::from(data))
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(())
    }

    /// Delete an object, reporting whether it existed.
    async fn delete_object(&self, path: &ObjectPath) -> Result<bool, StorageError> {
        match self.store.head(path).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(StorageError::S3(e.to_string())),
        }

        match self.store.delete(path).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::S3(e.to_string())),
        }
    }

    // ==================== Blob operations ====================

    /// Check if a blob exists.
    pub async fn blob_exists(&self, digest: &str) -> Result<bool, StorageError> {
        let path = self.blob_path(digest)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::S3(e.to_string())),
        }
    }

    /// Get the size of a blob.
    pub async fn blob_size(&self, digest: &str) -> Result<u64, StorageError> {
        let path = self.blob_path(digest)?;
        let meta = self.store.head(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(digest.to_string()),
            _ => StorageError::S3(e.to_string()),
        })?;
        Ok(meta.size as u64)
    }

    /// Stream a blob together with its size.
    pub async fn get_blob(&self, digest: &str) -> Result<(ByteStream, u64), StorageError> {
        let path = self.blob_path(digest)?;
        debug!("Streaming blob from S3: {:?}", path);

        let result = self.store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(digest.to_string()),
            _ => StorageError::S3(e.to_string()),
        })?;

        let size = result.meta.size as u64;
        let stream = result
            .into_stream()
            .map_err(|e| StorageError::S3(format!("Stream error: {}", e)));

        Ok((Box::pin(stream), size))
    }

    /// Store a blob, verifying the declared digest.
    ///
    /// Re-putting an existing digest is a no-op success.
    pub async fn put_blob(&self, digest: &str, data: Bytes) -> Result<(), StorageError> {
        let computed = compute_sha256(&data);
        if computed != digest {
            return Err(StorageError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        let path = self.blob_path(digest)?;
        debug!("Writing blob to S3: {:?}", path);
        self.put_object(&path, data).await
    }

    /// Store a blob from a stream, hashing each chunk inline.
    ///
    /// The multipart upload is aborted when the final digest does not match
    /// the declared one, so a failed write leaves no object behind.
    pub async fn put_blob_stream(
        &self,
        digest: &str,
        mut stream: ByteStream,
    ) -> Result<(), StorageError> {
        let path = self.blob_path(digest)?;
        debug!("Writing blob stream to S3: {:?}", path);

        let mut upload = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|e| StorageError::S3(format!("Failed to start multipart upload: {}", e)))?;

        let mut hasher = DigestHasher::new();
        let mut buffer = Vec::with_capacity(MULTIPART_PART_SIZE);

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.abort_upload(&mut *upload, &path).await;
                    return Err(e);
                }
            };
            hasher.update(&chunk);
            buffer.extend_from_slice(&chunk);

            if buffer.len() >= MULTIPART_PART_SIZE {
                let part = Bytes::from(std::mem::replace(
                    &mut buffer,
                    Vec::with_capacity(MULTIPART_PART_SIZE),
                ));
                if let Err(e) = upload.put_part(PutPayload::from(part)).await {
                    self.abort_upload(&mut *upload, &path).await;
                    return Err(StorageError::S3(format!("Failed to upload part: {}", e)));
                }
            }
        }

        let computed = hasher.finalize();
        if computed != digest {
            self.abort_upload(&mut *upload, &path).await;
            return Err(StorageError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        if !buffer.is_empty() {
            upload
                .put_part(PutPayload::from(Bytes::from(buffer)))
                .await
                .map_err(|e| StorageError::S3(format!("Failed to upload final part: {}", e)))?;
        }

        upload
            .complete()
            .await
            .map_err(|e| StorageError::S3(format!("Failed to complete multipart upload: {}", e)))?;

        Ok(())
    }

    async fn abort_upload(&self, upload: &mut dyn object_store::MultipartUpload, path: &ObjectPath) {
        if let Err(e) = upload.abort().await {
            warn!("Failed to abort multipart upload (path: {:?}): {}", path, e);
        }
    }

    /// Delete a blob. Returns false when it did not exist.
    pub async fn delete_blob(&self, digest: &str) -> Result<bool, StorageError> {
        let path = self.blob_path(digest)?;
        debug!("Deleting blob from S3: {:?}", path);
        self.delete_object(&path).await
    }

    // ==================== Manifest operations ====================

    /// Get a manifest by tag or digest, resolving tag links transparently.
    ///
    /// Returns the manifest bytes and their digest. A dangling tag link
    /// (link present, content missing) is reported as not found.
    pub async fn get_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> Result<(Bytes, String), StorageError> {
        let digest = if is_digest(reference) {
            parse_digest(reference)?;
            reference.to_string()
        } else {
            let link = self.tag_link_path(name, reference);
            let body = self.get_object(&link).await.map_err(|e| match e {
                StorageError::NotFound(_) => {
                    StorageError::NotFound(format!("{}:{}", name, reference))
                }
                other => other,
            })?;
            String::from_utf8_lossy(&body).trim().to_string()
        };

        let content_path = self.manifest_revision_path(name, &digest);
        let content = self.get_object(&content_path).await.map_err(|e| match e {
            StorageError::NotFound(_) => StorageError::NotFound(format!("{}@{}", name, digest)),
            other => other,
        })?;

        Ok((content, digest))
    }

    /// Store a manifest and return its digest.
    ///
    /// The content object is written before the tag link so a reader that
    /// observes the new link always finds the content.
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        content: Bytes,
    ) -> Result<String, StorageError> {
        let digest = compute_sha256(&content);

        let content_path = self.manifest_revision_path(name, &digest);
        self.put_object(&content_path, content).await?;

        if !is_digest(reference) {
            let link = self.tag_link_path(name, reference);
            self.put_object(&link, Bytes::from(digest.clone())).await?;
        }

        debug!("Stored manifest {}:{} -> {}", name, reference, digest);
        Ok(digest)
    }

    /// Delete a manifest. A tag reference removes only the link; a digest
    /// reference removes the revision. Returns false when nothing existed.
    pub async fn delete_manifest(&self, name: &str, reference: &str) -> Result<bool, StorageError> {
        if is_digest(reference) {
            parse_digest(reference)?;
            let path = self.manifest_revision_path(name, reference);
            self.delete_object(&path).await
        } else {
            let path = self.tag_link_path(name, reference);
            self.delete_object(&path).await
        }
    }

    /// List all tags of a repository, lexicographically sorted.
    pub async fn list_tags(&self, name: &str) -> Result<Vec<String>, StorageError> {
        let prefix = ObjectPath::from(format!("repositories/{}/_manifests/tags", name));
        let listing = self
            .store
            .list_with_delimiter(Some(&prefix))
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        let mut tags: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.parts().last().map(|part| part.as_ref().to_string()))
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// List all repository names, lexicographically sorted.
    ///
    /// Proxy-cache repositories (under `_proxy/`) are internal and not
    /// part of the catalog.
    pub async fn list_repositories(&self) -> Result<Vec<String>, StorageError> {
        let prefix = ObjectPath::from("repositories");
        let mut listing = self.store.list(Some(&prefix));

        let mut repos = BTreeSet::new();
        while let Some(meta) = listing.next().await {
            let meta = meta.map_err(|e| StorageError::S3(e.to_string()))?;
            let parts: Vec<String> = meta
                .location
                .parts()
                .map(|p| p.as_ref().to_string())
                .collect();
            // parts[0] is "repositories"; the name runs until "_manifests"
            if let Some(pos) = parts.iter().position(|p| p == "_manifests") {
                if pos > 1 && parts[1] != "_proxy" {
                    repos.insert(parts[1..pos].join("/"));
                }
            }
        }

        Ok(repos.into_iter().collect())
    }

    // ==================== Helm chart operations ====================

    /// Get a chart tarball.
    pub async fn get_chart(&self, name: &str, version: &str) -> Result<Bytes, StorageError> {
        let path = self.chart_path(name, version);
        self.get_object(&path).await.map_err(|e| match e {
            StorageError::NotFound(_) => {
                StorageError::NotFound(format!("chart {}-{}", name, version))
            }
            other => other,
        })
    }

    /// Store a chart tarball under its computed key.
    pub async fn put_chart(
        &self,
        name: &str,
        version: &str,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let path = self.chart_path(name, version);
        debug!("Storing chart: {:?}", path);
        self.put_object(&path, content).await
    }

    /// Delete a chart. Returns false when it did not exist.
    pub async fn delete_chart(&self, name: &str, version: &str) -> Result<bool, StorageError> {
        let path = self.chart_path(name, version);
        self.delete_object(&path).await
    }

    /// List stored charts as (name, version) pairs, sorted.
    pub async fn list_charts(&self) -> Result<Vec<(String, String)>, StorageError> {
        let prefix = ObjectPath::from("charts");
        let mut listing = self.store.list(Some(&prefix));

        let mut charts = BTreeSet::new();
        while let Some(meta) = listing.next().await {
            let meta = meta.map_err(|e| StorageError::S3(e.to_string()))?;
            let parts: Vec<String> = meta
                .location
                .parts()
                .map(|p| p.as_ref().to_string())
                .collect();
            // charts/<name>/<name>-<version>.tgz
            if parts.len() != 3 {
                continue;
            }
            let chart_name = &parts[1];
            let filename = &parts[2];
            if let Some(stem) = filename.strip_suffix(".tgz") {
                if let Some(version) = stem.strip_prefix(&format!("{}-", chart_name)) {
                    if !version.is_empty() {
                        charts.insert((chart_name.clone(), version.to_string()));
                    }
                }
            }
        }

        Ok(charts.into_iter().collect())
    }

    // ==================== Cache metadata ====================

    /// Get cache metadata for a proxied (upstream, image, tag) tuple.
    pub async fn get_cache_meta(
        &self,
        upstream: &str,
        image: &str,
        tag: &str,
    ) -> Result<Option<CacheMeta>, StorageError> {
        let path = self.cache_meta_path(upstream, image, tag);
        match self.get_object(&path).await {
            Ok(body) => {
                let meta: CacheMeta = serde_json::from_slice(&body).map_err(|e| {
                    StorageError::Backend(format!("corrupt cache metadata at {}: {}", path, e))
                })?;
                Ok(Some(meta))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store cache metadata, overwriting any previous document.
    pub async fn put_cache_meta(
        &self,
        upstream: &str,
        image: &str,
        tag: &str,
        meta: &CacheMeta,
    ) -> Result<(), StorageError> {
        let path = self.cache_meta_path(upstream, image, tag);
        let body = serde_json::to_vec(meta)
            .map_err(|e| StorageError::Backend(format!("serialize cache metadata: {}", e)))?;
        self.put_object(&path, Bytes::from(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> S3Store {
        S3Store::new(S3Config {
            access_key: Some("test".to_string()),
            secret_key: Some("test".to_string()),
            ..S3Config::default()
        })
        .unwrap()
    }

    #[test]
    fn blob_key_is_sharded() {
        let s = store();
        let digest = compute_sha256(b"x");
        let path = s.blob_path(&digest).unwrap();
        let hex = digest.strip_prefix("sha256:").unwrap();
        assert_eq!(
            path.to_string(),
            format!("blobs/sha256/{}/{}", &hex[..2], hex)
        );
    }

    #[test]
    fn blob_key_rejects_bad_digest() {
        let s = store();
        assert!(s.blob_path("sha256:nothex").is_err());
        assert!(s.blob_path("md5:abcd").is_err());
    }

    #[test]
    fn manifest_keys_match_layout() {
        let s = store();
        assert_eq!(
            s.manifest_revision_path("library/nginx", "sha256:abc").to_string(),
            "repositories/library/nginx/_manifests/revisions/sha256:abc/content"
        );
        assert_eq!(
            s.tag_link_path("library/nginx", "v1").to_string(),
            "repositories/library/nginx/_manifests/tags/v1/link"
        );
    }

    #[test]
    fn chart_and_meta_keys_match_layout() {
        let s = store();
        assert_eq!(
            s.chart_path("foo", "1.0.0").to_string(),
            "charts/foo/foo-1.0.0.tgz"
        );
        assert_eq!(
            s.cache_meta_path("dockerhub", "library/nginx", "latest").to_string(),
            "cache/dockerhub/library/nginx/latest/meta.json"
        );
    }

    #[test]
    fn cache_meta_round_trips_json() {
        let meta = CacheMeta {
            digest: "sha256:abc".to_string(),
            mutable: true,
            last_check_epoch: 1000,
            last_updated_epoch: 900,
        };
        let body = serde_json::to_vec(&meta).unwrap();
        let parsed: CacheMeta = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.digest, meta.digest);
        assert!(parsed.mutable);
        assert_eq!(parsed.last_check_epoch, 1000);
    }
}
