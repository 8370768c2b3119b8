//! Repo Worker storage layer
//!
//! This crate owns every durable key in the S3-compatible object store:
//! content-addressed blobs, manifest revisions and tag links, Helm charts,
//! and pull-through cache metadata. No other crate writes to the store.

pub mod digest;
pub mod error;
pub mod s3;

pub use digest::{DigestHasher, compute_sha256, is_digest, validate_digest};
pub use error::StorageError;
pub use s3::{ByteStream, CacheMeta, S3Config, S3Store};
