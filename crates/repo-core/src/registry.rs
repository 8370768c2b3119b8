//! Local registry operations and blob-upload sessions
//!
//! Upload sessions are ephemeral: created by POST, grown by PATCH, consumed
//! by PUT, or expired by the supervisor sweep. They never survive a restart.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use repo_storage::{S3Store, StorageError, compute_sha256, is_digest};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreError;

/// How long an idle upload session survives before the sweep removes it.
pub const UPLOAD_SESSION_TTL_HOURS: i64 = 24;

/// An in-flight chunked blob upload.
#[derive(Debug)]
pub struct UploadSession {
    pub repository: String,
    buffer: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl UploadSession {
    fn new(repository: &str) -> Self {
        let now = Utc::now();
        Self {
            repository: repository.to_string(),
            buffer: Vec::new(),
            created_at: now,
            last_active: now,
        }
    }

    pub fn offset(&self) -> u64 {
        self.buffer.len() as u64
    }
}

/// Registry service for locally stored repositories.
pub struct RegistryService {
    storage: Arc<S3Store>,
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl RegistryService {
    pub fn new(storage: Arc<S3Store>) -> Self {
        Self {
            storage,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    // ==================== Manifest operations ====================

    /// Get a manifest by tag or digest.
    pub async fn get_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> Result<(Bytes, String), CoreError> {
        self.storage
            .get_manifest(name, reference)
            .await
            .map_err(map_not_found)
    }

    /// Store a manifest, returning its digest.
    ///
    /// A digest reference must match the content; a tag reference also
    /// writes the tag link.
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        content: Bytes,
    ) -> Result<String, CoreError> {
        if is_digest(reference) {
            let computed = compute_sha256(&content);
            if computed != reference {
                return Err(CoreError::Storage(StorageError::DigestMismatch {
                    expected: reference.to_string(),
                    actual: computed,
                }));
            }
        }

        Ok(self.storage.put_manifest(name, reference, content).await?)
    }

    /// Delete a manifest (tag removes the link, digest removes the revision).
    pub async fn delete_manifest(&self, name: &str, reference: &str) -> Result<bool, CoreError> {
        Ok(self.storage.delete_manifest(name, reference).await?)
    }

    /// List tags, lexicographically sorted.
    pub async fn list_tags(&self, name: &str) -> Result<Vec<String>, CoreError> {
        Ok(self.storage.list_tags(name).await?)
    }

    /// List repositories, lexicographically sorted.
    pub async fn list_repositories(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.storage.list_repositories().await?)
    }

    // ==================== Blob operations ====================

    pub async fn blob_size(&self, digest: &str) -> Result<Option<u64>, CoreError> {
        if !self.storage.blob_exists(digest).await? {
            return Ok(None);
        }
        Ok(Some(self.storage.blob_size(digest).await?))
    }

    pub async fn get_blob(
        &self,
        digest: &str,
    ) -> Result<(repo_storage::ByteStream, u64), CoreError> {
        self.storage.get_blob(digest).await.map_err(map_not_found)
    }

    pub async fn delete_blob(&self, digest: &str) -> Result<bool, CoreError> {
        Ok(self.storage.delete_blob(digest).await?)
    }

    /// Store a blob directly (single-shot monolithic upload).
    pub async fn put_blob(&self, digest: &str, content: Bytes) -> Result<(), CoreError> {
        Ok(self.storage.put_blob(digest, content).await?)
    }

    // ==================== Upload sessions ====================

    /// Create a new upload session and return its id.
    pub fn start_upload(&self, repository: &str) -> String {
        let session_id = Uuid::new_v4().to_string();
        debug!("Starting upload session {} for {}", session_id, repository);
        self.sessions
            .lock()
            .insert(session_id.clone(), UploadSession::new(repository));
        session_id
    }

    fn validate_session_id(session_id: &str) -> Result<(), CoreError> {
        Uuid::parse_str(session_id)
            .map(|_| ())
            .map_err(|_| CoreError::BadRequest(format!("Invalid session id: {}", session_id)))
    }

    /// Current offset of a session, or None when it does not exist.
    pub fn upload_status(&self, session_id: &str) -> Result<Option<u64>, CoreError> {
        Self::validate_session_id(session_id)?;
        Ok(self.sessions.lock().get(session_id).map(|s| s.offset()))
    }

    /// Append a chunk, returning the new total offset.
    pub fn append_upload(&self, session_id: &str, chunk: &[u8]) -> Result<u64, CoreError> {
        Self::validate_session_id(session_id)?;
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("Upload session: {}", session_id)))?;

        session.buffer.extend_from_slice(chunk);
        session.last_active = Utc::now();
        Ok(session.offset())
    }

    /// Complete an upload: verify the declared digest over all chunks and
    /// store the blob. The session is consumed either way; a digest
    /// mismatch discards the data.
    pub async fn complete_upload(
        &self,
        session_id: &str,
        digest: &str,
        final_chunk: &[u8],
    ) -> Result<(), CoreError> {
        Self::validate_session_id(session_id)?;
        repo_storage::validate_digest(digest).map_err(CoreError::Storage)?;

        let mut session = {
            let mut sessions = self.sessions.lock();
            sessions
                .remove(session_id)
                .ok_or_else(|| CoreError::NotFound(format!("Upload session: {}", session_id)))?
        };
        session.buffer.extend_from_slice(final_chunk);

        debug!(
            "Completing upload {} -> {} ({} bytes)",
            session_id,
            digest,
            session.buffer.len()
        );

        self.storage
            .put_blob(digest, Bytes::from(session.buffer))
            .await?;
        Ok(())
    }

    /// Discard an upload session. Returns false when it did not exist.
    pub fn cancel_upload(&self, session_id: &str) -> Result<bool, CoreError> {
        Self::validate_session_id(session_id)?;
        Ok(self.sessions.lock().remove(session_id).is_some())
    }

    /// Remove sessions idle longer than the TTL. Returns how many were
    /// dropped.
    pub fn sweep_expired_uploads(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - ttl;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.last_active >= cutoff;
            if !keep {
                warn!(
                    "Expiring upload session {} for {} (idle since {})",
                    id, session.repository, session.last_active
                );
            }
            keep
        });
        before - sessions.len()
    }
}

/// Periodic upload-session sweep.
pub fn spawn_upload_sweep(
    registry: Arc<RegistryService>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        "Starting upload-session sweep (interval: {:?}, ttl: {}h)",
        interval, UPLOAD_SESSION_TTL_HOURS
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let swept = registry.sweep_expired_uploads(Duration::hours(UPLOAD_SESSION_TTL_HOURS));
            if swept > 0 {
                info!("Swept {} expired upload sessions", swept);
            }
        }
    })
}

fn map_not_found(e: StorageError) -> CoreError {
    match e {
        StorageError::NotFound(what) => CoreError::NotFound(what),
        other => CoreError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_storage::S3Config;

    fn service() -> RegistryService {
        let storage = Arc::new(
            S3Store::new(S3Config {
                access_key: Some("test".to_string()),
                secret_key: Some("test".to_string()),
                ..S3Config::default()
            })
            .unwrap(),
        );
        RegistryService::new(storage)
    }

    #[test]
    fn upload_session_lifecycle() {
        let svc = service();
        let id = svc.start_upload("myrepo");

        assert_eq!(svc.upload_status(&id).unwrap(), Some(0));
        assert_eq!(svc.append_upload(&id, b"hello ").unwrap(), 6);
        assert_eq!(svc.append_upload(&id, b"world").unwrap(), 11);

        assert!(svc.cancel_upload(&id).unwrap());
        // Second PATCH on a discarded session is a 404, not a new session
        assert!(matches!(
            svc.append_upload(&id, b"more"),
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(svc.upload_status(&id).unwrap(), None);
    }

    #[test]
    fn session_ids_must_be_uuids() {
        let svc = service();
        assert!(matches!(
            svc.append_upload("../../etc/passwd", b"x"),
            Err(CoreError::BadRequest(_))
        ));
        assert!(matches!(
            svc.upload_status("not-a-uuid"),
            Err(CoreError::BadRequest(_))
        ));
    }

    #[test]
    fn sweep_removes_only_idle_sessions() {
        let svc = service();
        let stale = svc.start_upload("old");
        let fresh = svc.start_upload("new");

        {
            let mut sessions = svc.sessions.lock();
            sessions.get_mut(&stale).unwrap().last_active =
                Utc::now() - Duration::hours(UPLOAD_SESSION_TTL_HOURS + 1);
        }

        assert_eq!(svc.sweep_expired_uploads(Duration::hours(UPLOAD_SESSION_TTL_HOURS)), 1);
        assert_eq!(svc.upload_status(&stale).unwrap(), None);
        assert_eq!(svc.upload_status(&fresh).unwrap(), Some(0));
    }

    #[tokio::test]
    async fn complete_upload_rejects_bad_digest_and_discards_session() {
        let svc = service();
        let id = svc.start_upload("myrepo");
        svc.append_upload(&id, b"payload").unwrap();

        let err = svc
            .complete_upload(&id, "sha256:not-a-digest", b"")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::InvalidDigest(_))));

        // Malformed digest is rejected before the session is consumed;
        // the session stays usable for a corrected PUT.
        assert_eq!(svc.upload_status(&id).unwrap(), Some(7));
    }
}
