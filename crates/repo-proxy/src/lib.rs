//! Repo Worker upstream proxy
//!
//! This crate provides the client for communicating with upstream container
//! registries (Docker Hub, GHCR, Quay, GCR), handling the Docker token
//! exchange and artifact fetching.

pub mod challenge;
pub mod client;
pub mod error;

pub use challenge::BearerChallenge;
pub use client::{ByteStream, ManifestResponse, UpstreamAuth, UpstreamClient, UpstreamClientConfig};
pub use error::ProxyError;
