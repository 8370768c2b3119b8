//! Repo Worker core business logic
//!
//! Ties the storage adapter and upstream clients together: the
//! pull-through cache controller, the local registry service with its
//! upload-session table, and the Helm chart service.

pub mod cache;
pub mod error;
pub mod helm;
pub mod pattern;
pub mod proxy;
pub mod registry;

pub use cache::CacheManager;
pub use error::CoreError;
pub use helm::{ChartIndex, ChartMetadata, HelmService, extract_chart_metadata};
pub use pattern::TagMatcher;
pub use proxy::ProxyHandler;
pub use registry::{RegistryService, UPLOAD_SESSION_TTL_HOURS, UploadSession, spawn_upload_sweep};
