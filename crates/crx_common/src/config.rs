//! Configuration for crxd.
//!
//! Loads settings from a TOML file (kebab-case keys). Every key has a
//! default, so an empty file is a valid config that tracks nothing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::ConfigError;
use crate::types::{ExtensionSpec, SourceKind};

/// Default browser version reported to the web store.
pub const DEFAULT_PRODVERSION: &str = "128.0";

/// Length of a browser extension id.
pub const EXTENSION_ID_LEN: usize = 32;

/// Route of the JSON status endpoint
pub const STATUS_PATH: &str = "/status";

/// Check an extension id: 32 characters from `a` to `p`.
pub fn is_valid_extension_id(id: &str) -> bool {
    id.len() == EXTENSION_ID_LEN && id.chars().all(|c| ('a'..='p').contains(&c))
}

/// Map a log level name to a tracing filter directive.
///
/// Accepts the names used by earlier releases (`WARNING`, `CRITICAL`,
/// `NOTSET`) alongside the tracing ones, case-insensitively.
pub fn log_filter_directive(level: &str) -> Option<&'static str> {
    match level.to_ascii_uppercase().as_str() {
        "NOTSET" | "TRACE" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARNING" | "WARN" => Some("warn"),
        "ERROR" | "CRITICAL" => Some("error"),
        _ => None,
    }
}

/// TLS settings for a listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsConfig {
    /// PEM certificate chain
    #[serde(default = "default_cert")]
    pub cert: PathBuf,

    /// PEM private key; read from `cert` when absent
    #[serde(default)]
    pub key: Option<PathBuf>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_cert() -> PathBuf {
    PathBuf::from("crx-repo.crt")
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: None,
            password: None,
        }
    }
}

/// TCP listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TcpListenConfig {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

impl Default for TcpListenConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            tls: None,
        }
    }
}

/// Unix domain socket listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnixListenConfig {
    #[serde(default = "default_socket_path")]
    pub path: PathBuf,

    /// Socket file mode written as octal digits, e.g. `660`
    #[serde(default = "default_permission")]
    pub permission: u32,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/crx-repo/crx-repo.socket")
}

fn default_permission() -> u32 {
    666
}

impl Default for UnixListenConfig {
    fn default() -> Self {
        Self {
            path: default_socket_path(),
            permission: default_permission(),
            tls: None,
        }
    }
}

impl UnixListenConfig {
    /// `permission` read as octal, `None` if it is not a valid file mode.
    pub fn mode(&self) -> Option<u32> {
        if self.permission > 777 {
            return None;
        }
        u32::from_str_radix(&self.permission.to_string(), 8).ok()
    }
}

/// Where to serve. At least one listener is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenConfig {
    #[serde(default)]
    pub tcp: Option<TcpListenConfig>,

    #[serde(default)]
    pub unix: Option<UnixListenConfig>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            tcp: Some(TcpListenConfig::default()),
            unix: None,
        }
    }
}

/// One `[[extensions]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExtensionConfig {
    pub extension_id: String,

    /// Human readable label, defaults to the id
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_provider")]
    pub extension_provider: String,

    /// Overrides the global proxy
    #[serde(default)]
    pub proxy: Option<String>,

    /// Overrides the global poll interval (seconds)
    #[serde(default)]
    pub interval: Option<u64>,

    /// Merged over `custom-args.<provider>` from the main config
    #[serde(default)]
    pub custom_args: toml::Table,
}

fn default_provider() -> String {
    "chrome".to_string()
}

impl ExtensionConfig {
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            name: None,
            extension_provider: default_provider(),
            proxy: None,
            interval: None,
            custom_args: toml::Table::new(),
        }
    }
}

/// Extensions may be listed as bare ids (older configs) or as tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionEntry {
    Id(String),
    Full(ExtensionConfig),
}

impl ExtensionEntry {
    fn to_config(&self) -> ExtensionConfig {
        match self {
            ExtensionEntry::Id(id) => ExtensionConfig::new(id.clone()),
            ExtensionEntry::Full(config) => config.clone(),
        }
    }
}

/// Main runtime config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path the update manifest is served at
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,

    /// Path prefix for package downloads
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// `scheme://host:port` used in manifest codebase URLs
    #[serde(default = "default_base")]
    pub base: String,

    #[serde(default)]
    pub proxy: Option<String>,

    /// Default poll interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Bound on each source call in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default)]
    pub listen: ListenConfig,

    /// Per-provider arguments, e.g. `[custom-args.chrome] version = "128.0"`
    #[serde(default)]
    pub custom_args: BTreeMap<String, toml::Table>,

    #[serde(default)]
    pub extensions: Vec<ExtensionEntry>,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_manifest_path() -> String {
    "/updates.xml".to_string()
}

fn default_prefix() -> String {
    "/crx-repo".to_string()
}

fn default_base() -> String {
    "http://localhost:8888".to_string()
}

fn default_interval() -> u64 {
    10_800 // 3 hours
}

fn default_timeout() -> u64 {
    60
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            manifest_path: default_manifest_path(),
            prefix: default_prefix(),
            base: default_base(),
            proxy: None,
            interval: default_interval(),
            timeout: default_timeout(),
            cache_dir: default_cache_dir(),
            listen: ListenConfig::default(),
            custom_args: BTreeMap::new(),
            extensions: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate the config file at `path`.
    ///
    /// A relative `cache-dir` is resolved against the directory holding the
    /// config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&contents)?;

        if let Some(parent) = path.parent() {
            config.resolve_paths(parent);
        }

        debug!(
            "Loaded config from {} ({} extensions)",
            path.display(),
            config.extensions.len()
        );
        Ok(config)
    }

    /// Parse and validate config text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Make relative file paths relative to the config file's directory.
    fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        };
        let resolve_tls = |tls: &mut Option<TlsConfig>| {
            if let Some(tls) = tls {
                resolve(&mut tls.cert);
                if let Some(key) = &mut tls.key {
                    resolve(key);
                }
            }
        };

        resolve(&mut self.cache_dir);
        if let Some(tcp) = &mut self.listen.tcp {
            resolve_tls(&mut tcp.tls);
        }
        if let Some(unix) = &mut self.listen.unix {
            resolve(&mut unix.path);
            resolve_tls(&mut unix.tls);
        }
    }

    fn normalize(&mut self) {
        self.base = self.base.trim_end_matches('/').to_string();

        if !self.prefix.starts_with('/') {
            self.prefix.insert(0, '/');
        }
        while self.prefix.len() > 1 && self.prefix.ends_with('/') {
            self.prefix.pop();
        }

        if !self.manifest_path.starts_with('/') {
            self.manifest_path.insert(0, '/');
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if log_filter_directive(&self.log_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log-level {:?}",
                self.log_level
            )));
        }
        if self.interval == 0 {
            return Err(ConfigError::Invalid("interval must be positive".into()));
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid("timeout must be positive".into()));
        }
        if self.listen.tcp.is_none() && self.listen.unix.is_none() {
            return Err(ConfigError::Invalid(
                "at least one of listen.tcp, listen.unix is required".into(),
            ));
        }
        if let Some(unix) = &self.listen.unix {
            if unix.mode().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "listen.unix.permission {} is not an octal file mode",
                    unix.permission
                )));
            }
        }
        if let Some(tcp) = &self.listen.tcp {
            if tcp.port == 0 {
                return Err(ConfigError::Invalid("listen.tcp.port must be positive".into()));
            }
        }
        if self.prefix == "/" {
            return Err(ConfigError::Invalid("prefix must not be empty".into()));
        }
        if self.manifest_path == STATUS_PATH
            || self.manifest_path == self.prefix
            || self.manifest_path.starts_with(&format!("{}/", self.prefix))
        {
            return Err(ConfigError::Invalid(format!(
                "manifest-path {} collides with {} or the package prefix {}",
                self.manifest_path, STATUS_PATH, self.prefix
            )));
        }
        self.extension_specs().map(|_| ())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Tracing filter directive for the configured log level.
    pub fn log_filter(&self) -> &'static str {
        log_filter_directive(&self.log_level).unwrap_or("info")
    }

    /// Resolve the extension list into specs, applying global defaults.
    pub fn extension_specs(&self) -> Result<Vec<ExtensionSpec>, ConfigError> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.extensions.len());

        for entry in &self.extensions {
            let ext = entry.to_config();

            if !is_valid_extension_id(&ext.extension_id) {
                return Err(ConfigError::Invalid(format!(
                    "invalid extension id {:?}",
                    ext.extension_id
                )));
            }
            if !seen.insert(ext.extension_id.clone()) {
                return Err(ConfigError::DuplicateExtension(ext.extension_id));
            }

            let interval = ext.interval.unwrap_or(self.interval);
            if interval == 0 {
                return Err(ConfigError::Invalid(format!(
                    "interval for {} must be positive",
                    ext.extension_id
                )));
            }

            let source = self.source_for(&ext)?;
            let spec = ExtensionSpec::new(
                ext.extension_id.clone(),
                source,
                Duration::from_secs(interval),
            )
            .with_label(ext.name.clone().unwrap_or_else(|| ext.extension_id.clone()))
            .with_proxy(ext.proxy.clone().or_else(|| self.proxy.clone()));

            specs.push(spec);
        }

        Ok(specs)
    }

    fn source_for(&self, ext: &ExtensionConfig) -> Result<SourceKind, ConfigError> {
        let mut args = self
            .custom_args
            .get(&ext.extension_provider)
            .cloned()
            .unwrap_or_default();
        args.extend(ext.custom_args.clone());

        match ext.extension_provider.as_str() {
            "chrome" => {
                let prodversion = match args.get("version") {
                    None => DEFAULT_PRODVERSION.to_string(),
                    Some(toml::Value::String(v)) => v.clone(),
                    Some(other) => {
                        return Err(ConfigError::Invalid(format!(
                            "custom-args version for {} must be a string, got {}",
                            ext.extension_id, other
                        )))
                    }
                };
                Ok(SourceKind::WebStore { prodversion })
            }
            other => Err(ConfigError::Invalid(format!(
                "unknown extension-provider {:?} for {}",
                other, ext.extension_id
            ))),
        }
    }
}
