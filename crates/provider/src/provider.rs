//! Provider trait implemented for each hosting service.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use cloudfile_upload::{Admission, UploadError, UploadObserver};
use serde::Serialize;

/// Most recent failure seen by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// HTTP status, when the failure came from the service.
    pub status: Option<u16>,
    pub message: String,
}

impl From<&UploadError> for LastError {
    fn from(e: &UploadError) -> Self {
        Self {
            status: e.status(),
            message: e.to_string(),
        }
    }
}

/// What a host needs from a cloud file provider.
///
/// Implemented per hosting service. Uploads report through the observer
/// passed to `upload_file`; the other methods are cheap lookups.
pub trait CloudFileProvider: Send + Sync {
    /// Stable identifier of the provider type.
    fn type_name(&self) -> &str;

    /// Human-readable service name.
    fn display_name(&self) -> &str;

    /// Base URL of the service.
    fn service_url(&self) -> String;

    /// Starts or queues the upload of `file`.
    fn upload_file(
        &self,
        file: PathBuf,
        observer: Arc<dyn UploadObserver>,
    ) -> Pin<Box<dyn Future<Output = Result<Admission, UploadError>> + Send + '_>>;

    /// Cancels the upload of `file`. Resolves to `false` if unknown.
    fn cancel_file_upload(
        &self,
        file: PathBuf,
    ) -> Pin<Box<dyn Future<Output = Result<bool, UploadError>> + Send + '_>>;

    /// Public URL of a file uploaded during this process lifetime.
    fn url_for_file(&self, file: &Path) -> Option<String>;

    /// Page a user can visit to learn more about `error`.
    fn provider_url_for_error(&self, error: &UploadError) -> String;

    fn last_error(&self) -> Option<LastError>;

    /// Largest file this provider will accept, in bytes.
    fn file_upload_size_limit(&self) -> u64;
}
