//! Upload configuration.
//!
//! Read from JSON so host applications can keep it next to their own
//! settings. Every field has a default; a missing file means defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Ceiling, UploadError};

/// Production service URL.
pub const DEFAULT_BASE_URL: &str = "https://transfer.sh";

/// Largest file the service accepts: 5 GiB.
pub const ABSOLUTE_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Default idle timeout: 5 minutes without progress.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Largest accepted staging copy buffer: 16 MiB.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Errors from loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("account not found: {0}")]
    UnknownAccount(String),
}

/// Settings for one upload account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Endpoint files are POSTed to.
    pub base_url: String,
    /// Service ceiling in bytes.
    pub max_file_size: u64,
    /// Account ceiling in bytes, if the account has one.
    pub account_limit: Option<u64>,
    /// Longest time an upload may go without sending or receiving a
    /// byte, in milliseconds. Also bounds connection setup.
    pub idle_timeout_ms: u64,
    /// Copy buffer size used while staging.
    pub chunk_size: usize,
    /// Directory for staging files (system temp dir when unset).
    pub staging_dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_file_size: ABSOLUTE_MAX_FILE_SIZE,
            account_limit: None,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            chunk_size: cloudfile_staging::DEFAULT_CHUNK_SIZE,
            staging_dir: None,
        }
    }
}

/// On-disk document holding several accounts keyed by account id.
#[derive(Debug, Default, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: HashMap<String, UploadConfig>,
}

impl UploadConfig {
    /// Loads a config from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no upload config, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config for account `key` from an accounts document.
    pub fn load_account(path: &Path, key: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut file: AccountsFile = serde_json::from_str(&content)?;
        let config = file
            .accounts
            .remove(key)
            .ok_or_else(|| ConfigError::UnknownAccount(key.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the base URL, the timeout and the chunk size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "idle_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "chunk_size",
                reason: format!("{} exceeds {MAX_CHUNK_SIZE}", self.chunk_size),
            });
        }

        let url = reqwest::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        Ok(())
    }

    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// The ceiling that actually governs admission.
    pub fn effective_limit(&self) -> u64 {
        match self.account_limit {
            Some(limit) => limit.min(self.max_file_size),
            None => self.max_file_size,
        }
    }

    /// Rejects sizes above either ceiling, naming the one exceeded.
    ///
    /// The service ceiling is checked first so the host can tell the
    /// user the file can never be uploaded, rather than blaming the
    /// account.
    pub fn check_size(&self, size: u64) -> Result<(), UploadError> {
        if size > self.max_file_size {
            return Err(UploadError::QuotaExceeded {
                ceiling: Ceiling::Absolute,
                size,
                limit: self.max_file_size,
            });
        }
        if let Some(limit) = self.account_limit
            && size > limit
        {
            return Err(UploadError::QuotaExceeded {
                ceiling: Ceiling::Account,
                size,
                limit,
            });
        }
        Ok(())
    }
}
