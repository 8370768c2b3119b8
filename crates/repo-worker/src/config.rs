//! Configuration loading
//!
//! Precedence: compiled defaults, then environment variables, then the
//! YAML file (when present). Built-in upstreams (dockerhub, ghcr, quay,
//! gcr) are registered with no credentials; `UPSTREAM_<NAME>_*` variables
//! add or override upstream entries.

use anyhow::{Context, Result};
use repo_proxy::{UpstreamAuth, UpstreamClientConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_s3_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_s3_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub use_ssl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Advisory bound on cached data; parsed and surfaced, not enforced.
    #[serde(default = "default_cache_max_size_gb")]
    pub max_size_gb: u64,
    #[serde(default = "default_mutable_tag_patterns")]
    pub mutable_tag_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub anonymous_pull: bool,
    #[serde(default)]
    pub jwt_secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
}

impl UpstreamConfig {
    /// Translate into a proxy client configuration.
    pub fn client_config(&self) -> UpstreamClientConfig {
        let auth = match self.auth_type.as_str() {
            "basic" => UpstreamAuth::Basic {
                username: self.username.clone(),
                password: self.password.clone(),
            },
            "token" | "bearer" | "bearer-static" => UpstreamAuth::Token(self.token.clone()),
            _ => UpstreamAuth::None,
        };
        UpstreamClientConfig {
            name: self.name.clone(),
            url: self.url.clone(),
            auth,
        }
    }
}

// ==================== YAML overlay ====================

/// YAML file schema: every field optional so the file only overrides what
/// it names.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    server: Option<ServerOverlay>,
    storage: Option<StorageOverlay>,
    cache: Option<CacheOverlay>,
    auth: Option<AuthOverlay>,
    logging: Option<LoggingOverlay>,
    upstreams: Option<Vec<UpstreamConfig>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerOverlay {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageOverlay {
    s3: Option<S3Overlay>,
}

#[derive(Debug, Default, Deserialize)]
struct S3Overlay {
    endpoint: Option<String>,
    bucket: Option<String>,
    region: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    use_ssl: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheOverlay {
    max_size_gb: Option<u64>,
    mutable_tag_patterns: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthOverlay {
    enabled: Option<bool>,
    anonymous_pull: Option<bool>,
    jwt_secret_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingOverlay {
    level: Option<String>,
}

// ==================== Defaults ====================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5050
}

fn default_s3_endpoint() -> String {
    "http://minio:9000".to_string()
}

fn default_s3_bucket() -> String {
    "repository".to_string()
}

fn default_cache_max_size_gb() -> u64 {
    100
}

fn default_mutable_tag_patterns() -> Vec<String> {
    vec!["latest".to_string(), "*nightly*".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_auth_type() -> String {
    "none".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: default_s3_endpoint(),
            bucket: default_s3_bucket(),
            region: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            use_ssl: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_gb: default_cache_max_size_gb(),
            mutable_tag_patterns: default_mutable_tag_patterns(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anonymous_pull: true,
            jwt_secret_key: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            s3: S3Config::default(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            upstreams: builtin_upstreams(),
        }
    }
}

/// Upstreams registered at startup with no credentials.
pub fn builtin_upstreams() -> Vec<UpstreamConfig> {
    [
        ("dockerhub", "https://registry-1.docker.io"),
        ("ghcr", "https://ghcr.io"),
        ("quay", "https://quay.io"),
        ("gcr", "https://gcr.io"),
    ]
    .into_iter()
    .map(|(name, url)| UpstreamConfig {
        name: name.to_string(),
        url: url.to_string(),
        auth_type: default_auth_type(),
        username: String::new(),
        password: String::new(),
        token: String::new(),
    })
    .collect()
}

impl Config {
    /// Load configuration: defaults, then environment, then the YAML file.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(&collect_env());

        if let Some(path) = path {
            if Path::new(path).exists() {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path))?;
                let overlay: ConfigOverlay = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path))?;
                config.apply_overlay(overlay);
                info!("Loaded configuration from {}", path);
            } else {
                info!("Config file not found at {}, using env and defaults", path);
            }
        }

        Ok(config)
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) {
        let get = |key: &str| env.get(key).cloned();
        let get_bool = |key: &str| get(key).map(|v| v.to_lowercase() == "true");

        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }

        if let Some(endpoint) = get("S3_ENDPOINT") {
            self.s3.endpoint = endpoint;
        }
        if let Some(bucket) = get("S3_BUCKET") {
            self.s3.bucket = bucket;
        }
        if let Some(region) = get("S3_REGION") {
            self.s3.region = region;
        }
        if let Some(access_key) = get("S3_ACCESS_KEY") {
            self.s3.access_key = access_key;
        }
        if let Some(secret_key) = get("S3_SECRET_KEY") {
            self.s3.secret_key = secret_key;
        }
        if let Some(use_ssl) = get_bool("S3_USE_SSL") {
            self.s3.use_ssl = use_ssl;
        }

        if let Some(enabled) = get_bool("AUTH_ENABLED") {
            self.auth.enabled = enabled;
        }
        if let Some(anonymous_pull) = get_bool("ANONYMOUS_PULL") {
            self.auth.anonymous_pull = anonymous_pull;
        }
        if let Some(secret) = get("JWT_SECRET_KEY") {
            self.auth.jwt_secret_key = secret;
        }

        if let Some(max) = get("CACHE_MAX_SIZE_GB").and_then(|v| v.parse().ok()) {
            self.cache.max_size_gb = max;
        }
        if let Some(patterns) = get("MUTABLE_TAG_PATTERNS") {
            self.cache.mutable_tag_patterns = patterns
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }

        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = level;
        }

        self.apply_env_upstreams(env);
    }

    /// `UPSTREAM_<NAME>_URL` etc. add new upstreams or override builtins.
    fn apply_env_upstreams(&mut self, env: &HashMap<String, String>) {
        const FIELDS: [&str; 5] = ["_URL", "_AUTH_TYPE", "_USERNAME", "_PASSWORD", "_TOKEN"];

        for (key, value) in env {
            let Some(rest) = key.strip_prefix("UPSTREAM_") else {
                continue;
            };
            let Some(suffix) = FIELDS.iter().find(|f| rest.ends_with(**f)) else {
                continue;
            };
            let name = rest[..rest.len() - suffix.len()].to_lowercase();
            if name.is_empty() {
                continue;
            }

            let upstream = match self.upstreams.iter_mut().find(|u| u.name == name) {
                Some(existing) => existing,
                None => {
                    self.upstreams.push(UpstreamConfig {
                        name: name.clone(),
                        url: String::new(),
                        auth_type: default_auth_type(),
                        username: String::new(),
                        password: String::new(),
                        token: String::new(),
                    });
                    self.upstreams.last_mut().unwrap()
                }
            };

            match *suffix {
                "_URL" => upstream.url = value.clone(),
                "_AUTH_TYPE" => upstream.auth_type = value.to_lowercase(),
                "_USERNAME" => upstream.username = value.clone(),
                "_PASSWORD" => upstream.password = value.clone(),
                "_TOKEN" => upstream.token = value.clone(),
                _ => {}
            }
        }

        // An upstream without a URL cannot be dialed
        self.upstreams.retain(|u| !u.url.is_empty());
    }

    fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        if let Some(server) = overlay.server {
            if let Some(host) = server.host {
                self.server.host = host;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
        }

        if let Some(s3) = overlay.storage.and_then(|s| s.s3) {
            if let Some(endpoint) = s3.endpoint {
                self.s3.endpoint = endpoint;
            }
            if let Some(bucket) = s3.bucket {
                self.s3.bucket = bucket;
            }
            if let Some(region) = s3.region {
                self.s3.region = region;
            }
            if let Some(access_key) = s3.access_key {
                self.s3.access_key = access_key;
            }
            if let Some(secret_key) = s3.secret_key {
                self.s3.secret_key = secret_key;
            }
            if let Some(use_ssl) = s3.use_ssl {
                self.s3.use_ssl = use_ssl;
            }
        }

        if let Some(cache) = overlay.cache {
            if let Some(max) = cache.max_size_gb {
                self.cache.max_size_gb = max;
            }
            if let Some(patterns) = cache.mutable_tag_patterns {
                self.cache.mutable_tag_patterns = patterns;
            }
        }

        if let Some(auth) = overlay.auth {
            if let Some(enabled) = auth.enabled {
                self.auth.enabled = enabled;
            }
            if let Some(anonymous_pull) = auth.anonymous_pull {
                self.auth.anonymous_pull = anonymous_pull;
            }
            if let Some(secret) = auth.jwt_secret_key {
                self.auth.jwt_secret_key = secret;
            }
        }

        if let Some(logging) = overlay.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
        }

        // A YAML upstream list extends the builtins, overriding by name.
        if let Some(upstreams) = overlay.upstreams {
            for upstream in upstreams {
                match self.upstreams.iter_mut().find(|u| u.name == upstream.name) {
                    Some(existing) => *existing = upstream,
                    None => self.upstreams.push(upstream),
                }
            }
        }
    }

    /// Storage-adapter configuration derived from the S3 section.
    pub fn storage_config(&self) -> repo_storage::S3Config {
        let optional = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        };
        repo_storage::S3Config {
            bucket: self.s3.bucket.clone(),
            region: if self.s3.region.is_empty() {
                "us-east-1".to_string()
            } else {
                self.s3.region.clone()
            },
            endpoint: optional(&self.s3.endpoint),
            access_key: optional(&self.s3.access_key),
            secret_key: optional(&self.s3.secret_key),
            allow_http: !self.s3.use_ssl,
        }
    }
}

fn collect_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_register_builtin_upstreams() {
        let config = Config::default();
        let names: Vec<&str> = config.upstreams.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["dockerhub", "ghcr", "quay", "gcr"]);
        assert!(config.auth.enabled);
        assert!(config.auth.anonymous_pull);
        assert_eq!(config.cache.mutable_tag_patterns, vec!["latest", "*nightly*"]);
    }

    #[test]
    fn env_overrides_defaults() {
        let mut config = Config::default();
        config.apply_env(&env(&[
            ("PORT", "9999"),
            ("S3_BUCKET", "artifacts"),
            ("AUTH_ENABLED", "false"),
            ("MUTABLE_TAG_PATTERNS", "latest, *rc*,edge"),
        ]));

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.s3.bucket, "artifacts");
        assert!(!config.auth.enabled);
        assert_eq!(config.cache.mutable_tag_patterns, vec!["latest", "*rc*", "edge"]);
    }

    #[test]
    fn env_upstreams_extend_and_override() {
        let mut config = Config::default();
        config.apply_env(&env(&[
            ("UPSTREAM_GHCR_AUTH_TYPE", "token"),
            ("UPSTREAM_GHCR_TOKEN", "gh-token"),
            ("UPSTREAM_INTERNAL_URL", "https://registry.corp.example"),
            ("UPSTREAM_INTERNAL_AUTH_TYPE", "basic"),
            ("UPSTREAM_INTERNAL_USERNAME", "svc"),
            ("UPSTREAM_INTERNAL_PASSWORD", "hunter2"),
        ]));

        let ghcr = config.upstreams.iter().find(|u| u.name == "ghcr").unwrap();
        assert_eq!(ghcr.auth_type, "token");
        assert_eq!(ghcr.token, "gh-token");

        let internal = config
            .upstreams
            .iter()
            .find(|u| u.name == "internal")
            .unwrap();
        assert_eq!(internal.url, "https://registry.corp.example");
        assert_eq!(internal.username, "svc");
    }

    #[test]
    fn yaml_overlays_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            concat!(
                "server:\n  port: 6000\n",
                "storage:\n  s3:\n    bucket: from-yaml\n",
                "auth:\n  anonymous_pull: false\n",
            )
        )
        .unwrap();

        // Environment first...
        let mut config = Config::default();
        config.apply_env(&env(&[("S3_BUCKET", "from-env"), ("PORT", "7000")]));
        // ...then the file wins where it speaks.
        let overlay: ConfigOverlay =
            serde_yaml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        config.apply_overlay(overlay);

        assert_eq!(config.server.port, 6000);
        assert_eq!(config.s3.bucket, "from-yaml");
        assert!(!config.auth.anonymous_pull);
        // Untouched fields keep their earlier values
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn upstream_auth_modes_translate() {
        let basic = UpstreamConfig {
            name: "up".to_string(),
            url: "https://r".to_string(),
            auth_type: "basic".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            token: String::new(),
        };
        assert!(matches!(
            basic.client_config().auth,
            UpstreamAuth::Basic { .. }
        ));

        let token = UpstreamConfig {
            auth_type: "bearer-static".to_string(),
            token: "t".to_string(),
            ..basic.clone()
        };
        assert!(matches!(token.client_config().auth, UpstreamAuth::Token(_)));

        let none = UpstreamConfig {
            auth_type: "none".to_string(),
            ..basic
        };
        assert!(matches!(none.client_config().auth, UpstreamAuth::None));
    }
}
