//! Batch manifest: the capture file listing every stream to download.
//!
//! The file is produced by a browser-side capture tool. Besides the manifest
//! URL each entry carries the HTTP identity the browser used (user agent,
//! referer, cookies, `Sec-Fetch-*` attributes), which is replayed on every
//! request of that job.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::error::JobError;

/// Request headers recorded alongside a captured URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapturedHeaders {
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub cookie: Option<String>,
}

/// `Sec-Fetch-*` request attributes recorded alongside a captured URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityHeaders {
    pub sec_fetch_site: Option<String>,
    pub sec_fetch_mode: Option<String>,
    pub sec_fetch_dest: Option<String>,
}

/// One captured stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub url: String,
    #[serde(default)]
    pub domain: Option<String>,
    /// Capture time, as recorded by the capture tool (number or string).
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub page_title: Option<String>,
    #[serde(default)]
    pub headers: Option<CapturedHeaders>,
    #[serde(default)]
    pub security_headers: Option<SecurityHeaders>,
}

impl ManifestEntry {
    /// Entry for a bare URL with no captured identity.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Recorded domain, else the URL host.
    pub fn domain(&self) -> String {
        if let Some(domain) = self.domain.as_deref().filter(|d| !d.is_empty()) {
            return domain.to_string();
        }
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// Parsed batch manifest. `links` order is the job order of the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    #[serde(default)]
    pub timestamp: Option<Value>,
    /// Informational only; `links.len()` is authoritative.
    #[serde(default)]
    pub count: Option<u64>,
    pub links: Vec<ManifestEntry>,
}

impl BatchManifest {
    /// A one-entry batch, used for single-URL mode.
    pub fn single(url: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            count: Some(1),
            links: vec![ManifestEntry::from_url(url)],
        }
    }

    pub async fn load(path: &Path) -> Result<Self, JobError> {
        let label = path.display().to_string();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| JobError::batch_manifest(&label, e))?;
        let manifest = Self::from_json_str(&content, &label)?;
        info!(
            path = %label,
            entries = manifest.links.len(),
            "Loaded batch manifest"
        );
        Ok(manifest)
    }

    /// Parse manifest text. `label` only decorates error messages.
    ///
    /// Besides the `{ links: [...] }` document, a bare array of entries or of
    /// URL strings is accepted.
    pub fn from_json_str(content: &str, label: &str) -> Result<Self, JobError> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| JobError::batch_manifest(label, e))?;

        let (timestamp, count, raw_links) = match value {
            Value::Object(mut map) => {
                let links = match map.remove("links") {
                    Some(Value::Array(links)) => links,
                    Some(_) => {
                        return Err(JobError::batch_manifest(label, "`links` is not an array"));
                    }
                    None => return Err(JobError::batch_manifest(label, "missing `links` array")),
                };
                let count = map.get("count").and_then(Value::as_u64);
                (map.remove("timestamp"), count, links)
            }
            Value::Array(links) => (None, None, links),
            _ => {
                return Err(JobError::batch_manifest(
                    label,
                    "top level must be an object or an array",
                ));
            }
        };

        let links = raw_links
            .into_iter()
            .enumerate()
            .map(|(i, raw)| match raw {
                Value::String(url) => Ok(ManifestEntry::from_url(url)),
                other => serde_json::from_value::<ManifestEntry>(other)
                    .map_err(|e| JobError::batch_manifest(label, format!("entry {i}: {e}"))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(count) = count
            && count as usize != links.len()
        {
            debug!(
                declared = count,
                actual = links.len(),
                "Manifest count differs from number of links"
            );
        }

        Ok(Self {
            timestamp,
            count,
            links,
        })
    }
}

impl From<Vec<ManifestEntry>> for BatchManifest {
    fn from(links: Vec<ManifestEntry>) -> Self {
        Self {
            timestamp: None,
            count: Some(links.len() as u64),
            links,
        }
    }
}
