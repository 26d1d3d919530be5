//! crx_common - Shared types for the crx-repo daemon
//!
//! Configuration model, version ordering, error taxonomy and the gupdate
//! manifest format.

pub mod config;
pub mod error;
pub mod manifest;
pub mod types;
pub mod version;

pub use config::{
    Config, ExtensionConfig, ExtensionEntry, ListenConfig, TcpListenConfig, TlsConfig,
    UnixListenConfig,
};
pub use error::{ConfigError, FetchError, FetchErrorKind, StoreError};
pub use manifest::{codebase_url, App, GUpdate, ManifestError, UpdateCheck};
pub use types::{CacheEntry, ExtensionSpec, SourceKind, VersionInfo};
pub use version::{compare_versions, is_newer_version, is_valid_version};

/// crx-repo version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
