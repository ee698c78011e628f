//! Upload error types.

use std::fmt;

/// Which size ceiling rejected a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ceiling {
    /// Hard limit of the hosting service.
    Absolute,
    /// Limit configured for the account.
    Account,
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ceiling::Absolute => f.write_str("service"),
            Ceiling::Account => f.write_str("account"),
        }
    }
}

/// Errors produced while admitting or running an upload.
///
/// Cloneable so a single outcome can be handed to every observer waiting
/// on the same file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("offline")]
    Offline,

    #[error("file of {size} bytes exceeds the {ceiling} limit of {limit} bytes")]
    QuotaExceeded {
        ceiling: Ceiling,
        size: u64,
        limit: u64,
    },

    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("upload coordinator stopped")]
    Coordinator,
}

impl UploadError {
    /// HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<cloudfile_staging::StagingError> for UploadError {
    fn from(e: cloudfile_staging::StagingError) -> Self {
        UploadError::Staging(e.to_string())
    }
}

impl From<crate::config::ConfigError> for UploadError {
    fn from(e: crate::config::ConfigError) -> Self {
        UploadError::Config(e.to_string())
    }
}
