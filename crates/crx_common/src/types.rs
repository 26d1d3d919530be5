//! Core data types shared between the engine and the serving layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Which source an extension is fetched from, with the source's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// The browser vendor's web store update service.
    WebStore {
        /// Browser version reported to the store as `prodversion`.
        prodversion: String,
    },
}

impl SourceKind {
    /// Provider name as written in the config file.
    pub fn provider(&self) -> &'static str {
        match self {
            SourceKind::WebStore { .. } => "chrome",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.provider())
    }
}

/// One tracked extension. Replaced wholesale on config reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSpec {
    pub id: String,
    pub label: String,
    pub source: SourceKind,
    pub interval: Duration,
    pub proxy: Option<String>,
}

impl ExtensionSpec {
    pub fn new(id: impl Into<String>, source: SourceKind, interval: Duration) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            source,
            interval,
            proxy: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }
}

/// Latest version reported by a source.
///
/// `download_url` is only meaningful for the download call that immediately
/// follows the check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub download_url: String,
    pub sha256: Option<String>,
    pub size: Option<u64>,
    pub prodversionmin: Option<String>,
}

impl VersionInfo {
    pub fn new(version: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            download_url: download_url.into(),
            sha256: None,
            size: None,
            prodversionmin: None,
        }
    }
}

/// Committed state of one cached package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub extension_id: String,
    pub version: String,
    /// Absolute path of the fully written package file.
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prodversionmin: Option<String>,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}
