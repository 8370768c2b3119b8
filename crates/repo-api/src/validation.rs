//! Repository name and reference validation
//!
//! Malformed names and references are rejected at the protocol layer
//! before any store access.

use crate::error::ApiError;

/// Validate a repository name: lowercase path components separated by `/`,
/// each matching `[a-z0-9]+([._-][a-z0-9]+)*`.
pub fn validate_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > 255 {
        return Err(ApiError::NameInvalid(name.to_string()));
    }

    for component in name.split('/') {
        if !valid_component(component) {
            return Err(ApiError::NameInvalid(name.to_string()));
        }
    }

    Ok(())
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    if bytes.is_empty() {
        return false;
    }

    let alnum = |b: u8| matches!(b, b'a'..=b'z' | b'0'..=b'9');
    let separator = |b: u8| matches!(b, b'.' | b'_' | b'-');

    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut prev_separator = false;
    for &b in bytes {
        if alnum(b) {
            prev_separator = false;
        } else if separator(b) {
            // No runs of separators
            if prev_separator {
                return false;
            }
            prev_separator = true;
        } else {
            return false;
        }
    }

    true
}

/// Validate a reference: either a digest or a tag matching
/// `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn validate_reference(reference: &str) -> Result<(), ApiError> {
    if repo_storage::is_digest(reference) {
        return repo_storage::validate_digest(reference)
            .map_err(|_| ApiError::DigestInvalid(reference.to_string()));
    }
    validate_tag(reference)
}

/// Validate a tag name.
pub fn validate_tag(tag: &str) -> Result<(), ApiError> {
    let bytes = tag.as_bytes();
    if bytes.is_empty() || bytes.len() > 128 {
        return Err(ApiError::ReferenceInvalid(tag.to_string()));
    }

    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    if !word(bytes[0]) {
        return Err(ApiError::ReferenceInvalid(tag.to_string()));
    }

    for &b in &bytes[1..] {
        if !(word(b) || matches!(b, b'.' | b'-')) {
            return Err(ApiError::ReferenceInvalid(tag.to_string()));
        }
    }

    Ok(())
}

/// Validate a digest, rejecting unknown algorithms and malformed hex.
pub fn validate_digest(digest: &str) -> Result<(), ApiError> {
    repo_storage::validate_digest(digest).map_err(|_| ApiError::DigestInvalid(digest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        for name in [
            "nginx",
            "library/nginx",
            "dockerhub/library/nginx",
            "my-team/app.service",
            "a/b/c/d",
            "repo_worker0",
        ] {
            assert!(validate_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for name in [
            "",
            "UPPER/case",
            "double//slash",
            "/leading",
            "trailing/",
            "bad--run",
            "-leading-dash",
            "trailing-dash-",
            "sp ace",
            "unicode/naïve",
        ] {
            assert!(validate_name(name).is_err(), "{} should be invalid", name);
        }
    }

    #[test]
    fn accepts_well_formed_tags() {
        for tag in ["latest", "v1.0.0", "_internal", "2024-01-01", "A.B-c_d"] {
            assert!(validate_tag(tag).is_ok(), "{} should be valid", tag);
        }
    }

    #[test]
    fn rejects_malformed_tags() {
        let long = "a".repeat(129);
        for tag in ["", ".hidden", "-dash", "has space", long.as_str()] {
            assert!(validate_tag(tag).is_err(), "{:?} should be invalid", tag);
        }
    }

    #[test]
    fn reference_dispatches_on_digest_prefix() {
        let digest = repo_storage::compute_sha256(b"x");
        assert!(validate_reference(&digest).is_ok());
        assert!(validate_reference("sha256:tooshort").is_err());
        assert!(validate_reference("latest").is_ok());
    }
}
