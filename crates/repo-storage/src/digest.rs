//! SHA-256 digest computation and validation
//!
//! Digests are `sha256:<64 lowercase hex>`. Unknown algorithms are rejected
//! before any store access.

use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Check whether a reference is a digest rather than a tag.
pub fn is_digest(reference: &str) -> bool {
    reference.starts_with("sha256:")
}

/// Parse a digest string into (algorithm, hex) parts.
///
/// Only `sha256` with a 64-character lowercase hex value is accepted.
pub fn parse_digest(digest: &str) -> Result<(&str, &str), StorageError> {
    let (algo, hash) = digest
        .split_once(':')
        .ok_or_else(|| StorageError::InvalidDigest(format!("missing algorithm: {}", digest)))?;

    if algo != "sha256" {
        return Err(StorageError::InvalidDigest(format!(
            "unsupported algorithm: {}",
            algo
        )));
    }

    if hash.len() != 64 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(StorageError::InvalidDigest(format!(
            "malformed sha256 hex: {}",
            digest
        )));
    }

    Ok((algo, hash))
}

/// Validate a digest string, discarding the parsed parts.
pub fn validate_digest(digest: &str) -> Result<(), StorageError> {
    parse_digest(digest).map(|_| ())
}

/// Compute the canonical digest of a byte slice.
pub fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Streaming SHA-256 hasher producing canonical digest strings.
///
/// Feeds one chunk at a time so blob uploads never buffer more than a single
/// chunk for hashing.
#[derive(Default)]
pub struct DigestHasher {
    inner: Sha256,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Finish hashing and return the canonical `sha256:<hex>` digest.
    pub fn finalize(self) -> String {
        format!("sha256:{}", hex::encode(self.inner.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_digest() {
        let digest = compute_sha256(b"hello");
        let (algo, hash) = parse_digest(&digest).unwrap();
        assert_eq!(algo, "sha256");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn reject_unknown_algorithm() {
        let err = parse_digest("sha512:0000").unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest(_)));
    }

    #[test]
    fn reject_short_hex() {
        assert!(parse_digest("sha256:abc123").is_err());
    }

    #[test]
    fn reject_uppercase_hex() {
        let upper = format!("sha256:{}", "A".repeat(64));
        assert!(parse_digest(&upper).is_err());
    }

    #[test]
    fn reject_missing_separator() {
        assert!(parse_digest("deadbeef").is_err());
    }

    #[test]
    fn streaming_matches_oneshot() {
        let mut hasher = DigestHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), compute_sha256(b"hello world"));
    }

    #[test]
    fn digest_references_detected() {
        assert!(is_digest("sha256:abc"));
        assert!(!is_digest("latest"));
        assert!(!is_digest("v1.0.0"));
    }
}
