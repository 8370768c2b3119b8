//! Repo Worker - content-addressable artifact registry
//!
//! Serves the OCI Distribution v2 protocol and the Helm chart repository
//! protocol over an S3-compatible object store, and pull-through caches
//! upstream registries with stale-while-revalidate semantics.

use anyhow::{Context, Result};
use clap::Parser;
use repo_api::{AppState, MetricsHandle, create_router};
use repo_auth::{AuthContext, AuthSettings, TokenValidator};
use repo_core::{CacheManager, HelmService, ProxyHandler, RegistryService, TagMatcher};
use repo_proxy::UpstreamClient;
use repo_storage::S3Store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::Config;

/// Interval between upload-session sweeps.
const UPLOAD_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long in-flight requests get to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Repo Worker - OCI registry, Helm repository, and pull-through cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<String>,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    init_logging(&config.logging.level);

    info!("Starting repo-worker v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Cache: max_size_gb={} (advisory), mutable patterns: {:?}",
        config.cache.max_size_gb, config.cache.mutable_tag_patterns
    );

    // Object store; an unreachable bucket is fatal at startup.
    let storage = Arc::new(S3Store::new(config.storage_config())?);
    storage
        .ensure_bucket()
        .await
        .with_context(|| format!("object-store bucket '{}' is not usable", config.s3.bucket))?;
    info!("S3 bucket '{}' ready", config.s3.bucket);

    // Upstream clients
    let mut clients = Vec::new();
    for upstream in &config.upstreams {
        match UpstreamClient::new(upstream.client_config()) {
            Ok(client) => {
                info!("Registered upstream {} -> {}", upstream.name, upstream.url);
                clients.push(Arc::new(client));
            }
            Err(e) => warn!("Skipping upstream {}: {}", upstream.name, e),
        }
    }

    // Core services
    let cache = Arc::new(CacheManager::new(
        Arc::clone(&storage),
        TagMatcher::new(&config.cache.mutable_tag_patterns),
    ));
    let proxy = Arc::new(ProxyHandler::new(
        Arc::clone(&storage),
        Arc::clone(&cache),
        clients,
    ));
    let registry = Arc::new(RegistryService::new(Arc::clone(&storage)));
    let helm = Arc::new(HelmService::new(Arc::clone(&storage)));

    // Token validation against the auth service's shared secret
    if config.auth.enabled && config.auth.jwt_secret_key.is_empty() {
        anyhow::bail!("AUTH_ENABLED is set but JWT_SECRET_KEY is empty");
    }
    let auth = Arc::new(AuthContext::new(
        AuthSettings {
            enabled: config.auth.enabled,
            anonymous_pull: config.auth.anonymous_pull,
        },
        TokenValidator::new(&config.auth.jwt_secret_key),
    ));

    // Upload-session expiry sweep
    let _sweep = repo_core::spawn_upload_sweep(Arc::clone(&registry), UPLOAD_SWEEP_INTERVAL);

    let metrics_handle = init_metrics();

    let state = AppState::new(storage, registry, proxy, helm, Arc::clone(&auth));
    let app = create_router(state, metrics_handle.map(Arc::new)).layer(TraceLayer::new_for_http());

    let host = args.host.unwrap_or(config.server.host);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", host, port))?;

    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drained (or the grace watchdog fired): drop background refreshes.
    cache.cancel_revalidations();
    info!("Server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Initialize Prometheus metrics
fn init_metrics() -> Option<MetricsHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics enabled at /metrics");

            metrics::describe_counter!(
                "repo_worker_requests_total",
                "Requests by endpoint class (blob_get, blob_put, manifest_get, manifest_put, proxy_hit, proxy_miss, proxy_revalidate)"
            );
            metrics::describe_histogram!(
                "repo_worker_request_duration_seconds",
                "Request duration by endpoint class"
            );

            Some(handle)
        }
        Err(e) => {
            warn!("Failed to initialize Prometheus metrics: {}", e);
            None
        }
    }
}

/// Wait for SIGTERM or ctrl-c, then cap the drain period.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await.expect("failed to install ctrl-c handler");

    info!(
        "Shutdown signal received, draining for up to {:?}",
        SHUTDOWN_GRACE
    );

    // In-flight requests get the grace period, then the process exits.
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        warn!("Drain period elapsed, exiting");
        std::process::exit(0);
    });
}
