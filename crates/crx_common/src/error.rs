//! Error types shared by the daemon and its collaborators.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Classification of a failed source call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The extension id is unknown to the source.
    NotFound,
    /// The source refused the request.
    Unauthorized,
    /// Network error, timeout or 5xx. Worth retrying on the next tick.
    Transient,
    /// The source answered with data we could not make sense of.
    Malformed,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::NotFound => write!(f, "not found"),
            FetchErrorKind::Unauthorized => write!(f, "unauthorized"),
            FetchErrorKind::Transient => write!(f, "transient"),
            FetchErrorKind::Malformed => write!(f, "malformed"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} source error: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Unauthorized, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transient, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Malformed, message)
    }

    /// Transient and malformed failures leave the cache untouched and are
    /// simply tried again on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::Transient | FetchErrorKind::Malformed
        )
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("Disk full: {0}")]
    DiskFull(io::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    #[error("Download interrupted: {0}")]
    Source(#[from] FetchError),
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::StorageFull {
            StoreError::DiskFull(e)
        } else {
            StoreError::Io(e)
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Extension {0} is listed more than once")]
    DuplicateExtension(String),
}
