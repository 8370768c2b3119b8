//! Helm chart repository service
//!
//! Charts are stored as uploaded; `index.yaml` is derived on request by
//! opening each tarball and reading its embedded `Chart.yaml`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use repo_storage::{S3Store, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use tar::Archive;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Metadata parsed from a chart's `Chart.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartMetadata {
    #[serde(rename = "apiVersion")]
    pub api_version: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "appVersion")]
    pub app_version: Option<String>,
    pub icon: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub home: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// One entry in the generated `index.yaml`.
#[derive(Debug, Serialize)]
pub struct IndexEntry {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "appVersion", skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    pub urls: Vec<String>,
    pub created: DateTime<Utc>,
}

/// The generated `index.yaml` document.
#[derive(Debug, Serialize)]
pub struct ChartIndex {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub generated: DateTime<Utc>,
    pub entries: BTreeMap<String, Vec<IndexEntry>>,
}

/// Helm chart repository operations.
pub struct HelmService {
    storage: Arc<S3Store>,
}

impl HelmService {
    pub fn new(storage: Arc<S3Store>) -> Self {
        Self { storage }
    }

    /// Store an uploaded chart tarball.
    ///
    /// The embedded `Chart.yaml` must carry both name and version;
    /// otherwise the upload is rejected and the store is left unchanged.
    pub async fn upload(&self, content: Bytes) -> Result<(String, String), CoreError> {
        let metadata = extract_chart_metadata(&content)?;

        let (Some(name), Some(version)) = (metadata.name.clone(), metadata.version.clone()) else {
            return Err(CoreError::BadRequest(
                "Chart.yaml must contain name and version".to_string(),
            ));
        };

        self.storage.put_chart(&name, &version, content).await?;
        debug!("Stored chart {}-{}", name, version);
        Ok((name, version))
    }

    /// Download a chart tarball.
    pub async fn download(&self, name: &str, version: &str) -> Result<Bytes, CoreError> {
        self.storage
            .get_chart(name, version)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(what) => CoreError::NotFound(what),
                other => CoreError::Storage(other),
            })
    }

    /// Delete a chart. Returns false when it did not exist.
    pub async fn delete(&self, name: &str, version: &str) -> Result<bool, CoreError> {
        Ok(self.storage.delete_chart(name, version).await?)
    }

    /// List stored charts as (name, version) pairs.
    pub async fn list(&self) -> Result<Vec<(String, String)>, CoreError> {
        Ok(self.storage.list_charts().await?)
    }

    /// Build the repository index from the stored tarballs.
    ///
    /// A tarball that cannot be parsed is skipped with a warning rather
    /// than failing the whole index.
    pub async fn index(&self) -> Result<ChartIndex, CoreError> {
        let mut entries: BTreeMap<String, Vec<IndexEntry>> = BTreeMap::new();
        let now = Utc::now();

        for (name, version) in self.storage.list_charts().await? {
            let content = match self.storage.get_chart(&name, &version).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping chart {}-{} in index: {}", name, version, e);
                    continue;
                }
            };

            let metadata = match extract_chart_metadata(&content) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Skipping unparsable chart {}-{}: {}", name, version, e);
                    continue;
                }
            };

            entries.entry(name.clone()).or_default().push(IndexEntry {
                api_version: metadata.api_version.unwrap_or_else(|| "v2".to_string()),
                name: name.clone(),
                version: version.clone(),
                description: metadata.description,
                app_version: metadata.app_version,
                icon: metadata.icon,
                keywords: metadata.keywords,
                home: metadata.home,
                sources: metadata.sources,
                urls: vec![format!("/charts/{}-{}.tgz", name, version)],
                created: now,
            });
        }

        Ok(ChartIndex {
            api_version: "v1".to_string(),
            generated: now,
            entries,
        })
    }
}

/// Read `Chart.yaml` out of a gzipped chart tarball.
///
/// The file is matched either at the archive root or nested one level as
/// `<chart>/Chart.yaml`, as `helm package` produces.
pub fn extract_chart_metadata(content: &[u8]) -> Result<ChartMetadata, CoreError> {
    let decoder = GzDecoder::new(content);
    let mut archive = Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| CoreError::BadRequest(format!("not a chart tarball: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| CoreError::BadRequest(format!("corrupt chart tarball: {}", e)))?;

        let path = entry
            .path()
            .map_err(|e| CoreError::BadRequest(format!("corrupt chart tarball: {}", e)))?
            .to_string_lossy()
            .into_owned();

        if path == "Chart.yaml" || path.ends_with("/Chart.yaml") {
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| CoreError::BadRequest(format!("unreadable Chart.yaml: {}", e)))?;

            return serde_yaml::from_slice(&buf)
                .map_err(|e| CoreError::BadRequest(format!("invalid Chart.yaml: {}", e)));
        }
    }

    Err(CoreError::BadRequest(
        "tarball does not contain Chart.yaml".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    pub(crate) fn chart_tarball(path: &str, chart_yaml: &str) -> Bytes {
        let mut builder = tar::Builder::new(Vec::new());
        let data = chart_yaml.as_bytes();

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();

        let tarball = builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tarball).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn extracts_nested_chart_yaml() {
        let tarball = chart_tarball(
            "foo/Chart.yaml",
            "apiVersion: v2\nname: foo\nversion: 1.0.0\ndescription: x\n",
        );
        let metadata = extract_chart_metadata(&tarball).unwrap();
        assert_eq!(metadata.name.as_deref(), Some("foo"));
        assert_eq!(metadata.version.as_deref(), Some("1.0.0"));
        assert_eq!(metadata.description.as_deref(), Some("x"));
    }

    #[test]
    fn extracts_root_chart_yaml() {
        let tarball = chart_tarball("Chart.yaml", "name: bar\nversion: 2.1.0\n");
        let metadata = extract_chart_metadata(&tarball).unwrap();
        assert_eq!(metadata.name.as_deref(), Some("bar"));
        assert_eq!(metadata.api_version, None);
    }

    #[test]
    fn rejects_tarball_without_chart_yaml() {
        let tarball = chart_tarball("foo/values.yaml", "replicas: 1\n");
        assert!(matches!(
            extract_chart_metadata(&tarball),
            Err(CoreError::BadRequest(_))
        ));
    }

    #[test]
    fn rejects_non_gzip_payload() {
        assert!(matches!(
            extract_chart_metadata(b"definitely not a tarball"),
            Err(CoreError::BadRequest(_))
        ));
    }

    #[test]
    fn optional_fields_survive_parsing() {
        let tarball = chart_tarball(
            "app/Chart.yaml",
            concat!(
                "apiVersion: v2\n",
                "name: app\n",
                "version: 0.3.0\n",
                "appVersion: \"9.1\"\n",
                "icon: https://example.com/icon.png\n",
                "keywords:\n  - web\n  - cache\n",
                "home: https://example.com\n",
                "sources:\n  - https://github.com/example/app\n",
            ),
        );
        let metadata = extract_chart_metadata(&tarball).unwrap();
        assert_eq!(metadata.app_version.as_deref(), Some("9.1"));
        assert_eq!(metadata.keywords, vec!["web", "cache"]);
        assert_eq!(metadata.sources, vec!["https://github.com/example/app"]);
    }

    #[test]
    fn index_serializes_in_helm_shape() {
        let index = ChartIndex {
            api_version: "v1".to_string(),
            generated: Utc::now(),
            entries: BTreeMap::from([(
                "foo".to_string(),
                vec![IndexEntry {
                    api_version: "v2".to_string(),
                    name: "foo".to_string(),
                    version: "1.0.0".to_string(),
                    description: Some("x".to_string()),
                    app_version: None,
                    icon: None,
                    keywords: vec![],
                    home: None,
                    sources: vec![],
                    urls: vec!["/charts/foo-1.0.0.tgz".to_string()],
                    created: Utc::now(),
                }],
            )]),
        };

        let yaml = serde_yaml::to_string(&index).unwrap();
        assert!(yaml.contains("apiVersion: v1"));
        assert!(yaml.contains("entries:"));
        assert!(yaml.contains("foo:"));
        assert!(yaml.contains("- /charts/foo-1.0.0.tgz"));
        assert!(!yaml.contains("icon"));
    }
}
