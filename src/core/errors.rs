//! NWD-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Top-level error type for nodewarden.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("[NWD-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[NWD-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[NWD-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[NWD-1101] run-as user {user:?} does not resolve on this host")]
    UnknownUser { user: String },

    #[error("[NWD-1102] invalid monitor policy at {path}: {details}")]
    InvalidPolicy { path: PathBuf, details: String },

    #[error("[NWD-1103] unknown tombstone action {key:?}")]
    UnknownAction { key: String },

    #[error("[NWD-1201] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[NWD-2001] not supervised: {path}")]
    NotSupervised { path: PathBuf },

    #[error("[NWD-2002] control command {command} failed with exit code {code:?}")]
    ControlFailed { command: String, code: Option<i32> },

    #[error("[NWD-2003] control of {path} still locked after {attempts} attempts")]
    ControlLocked { path: PathBuf, attempts: u32 },

    #[error("[NWD-2101] finish of {name} failed: {details}")]
    FinishFailed { name: String, details: String },

    #[error("[NWD-2201] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[NWD-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[NWD-3004] watch backend failure: {details}")]
    Watch { details: String },

    #[error("[NWD-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl WardenError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "NWD-1001",
            Self::MissingConfig { .. } => "NWD-1002",
            Self::ConfigParse { .. } => "NWD-1003",
            Self::UnknownUser { .. } => "NWD-1101",
            Self::InvalidPolicy { .. } => "NWD-1102",
            Self::UnknownAction { .. } => "NWD-1103",
            Self::UnsupportedPlatform { .. } => "NWD-1201",
            Self::NotSupervised { .. } => "NWD-2001",
            Self::ControlFailed { .. } => "NWD-2002",
            Self::ControlLocked { .. } => "NWD-2003",
            Self::FinishFailed { .. } => "NWD-2101",
            Self::Serialization { .. } => "NWD-2201",
            Self::Io { .. } => "NWD-3002",
            Self::Watch { .. } => "NWD-3004",
            Self::Runtime { .. } => "NWD-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Configuration errors and hard control errors are never retryable; the
    /// caller is expected to surface them instead of looping.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ControlLocked { .. } | Self::Watch { .. } | Self::Runtime { .. }
        )
    }

    /// Whether this is an IO failure for a path that does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for WardenError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<notify::Error> for WardenError {
    fn from(value: notify::Error) -> Self {
        Self::Watch {
            details: value.to_string(),
        }
    }
}
