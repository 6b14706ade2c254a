//! Error types
//!
//! Each concern gets its own error enum. Everything that happens while the
//! daemon is running is contained by the component that produced it; only
//! `ConfigError` is allowed to stop the process, and only at startup.

use std::path::PathBuf;
use thiserror::Error;

/// Serial transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("write to {port} failed: {source}")]
    Write {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("gave up on {port} after {attempts} attempts")]
    Exhausted { port: String, attempts: u32 },

    #[error("transport {0} is closed")]
    Closed(String),
}

impl TransportError {
    /// Whether the error points at a bad port setting rather than a
    /// device that is temporarily unreachable
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TransportError::Open { source, .. }
                if matches!(
                    source.kind(),
                    serialport::ErrorKind::NoDevice | serialport::ErrorKind::InvalidInput
                )
        )
    }
}

/// Configuration file problems (fatal at startup)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Override store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("override store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("override store {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to encode overrides: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Metadata lookup failures. These never leave the resolver; they are
/// logged and turned into "not found".
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("lookup timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("no usable aspect ratio in response")]
    Malformed,

    #[error("nothing to look up for {0}")]
    NotQueryable(String),
}

/// Bad inbound event line
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown trigger: {0}")]
    UnknownTrigger(String),

    #[error("unparseable aspect ratio: {0}")]
    BadRatio(String),
}
