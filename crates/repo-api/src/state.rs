//! Application state

use repo_auth::AuthContext;
use repo_core::{HelmService, ProxyHandler, RegistryService};
use repo_storage::S3Store;
use std::sync::Arc;

/// Type alias for the Prometheus metrics handle
pub type MetricsHandle = metrics_exporter_prometheus::PrometheusHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<S3Store>,
    pub registry: Arc<RegistryService>,
    pub proxy: Arc<ProxyHandler>,
    pub helm: Arc<HelmService>,
    pub auth: Arc<AuthContext>,
}

impl AppState {
    pub fn new(
        storage: Arc<S3Store>,
        registry: Arc<RegistryService>,
        proxy: Arc<ProxyHandler>,
        helm: Arc<HelmService>,
        auth: Arc<AuthContext>,
    ) -> Self {
        Self {
            storage,
            registry,
            proxy,
            helm,
            auth,
        }
    }
}
