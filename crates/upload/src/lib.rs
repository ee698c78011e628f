//! Client-side file uploads to a transfer.sh style hosting service.
//!
//! An [`UploadCoordinator`] accepts upload requests, checks them against
//! the size ceilings, and runs them one at a time in submission order.
//! Each upload is a [`TransferSession`]: the file is framed as a
//! `multipart/form-data` body in a staging file, POSTed to the service,
//! and the response body is read back as the public retrieval URL.
//!
//! Observers implementing [`UploadObserver`] get one `on_stop` call per
//! admitted request with the [`UploadOutcome`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod response;
pub mod session;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{ABSOLUTE_MAX_FILE_SIZE, ConfigError, DEFAULT_BASE_URL, UploadConfig};
pub use coordinator::{ActiveUpload, CoordinatorHandle, CoordinatorSnapshot, UploadCoordinator};
pub use error::{Ceiling, UploadError};
pub use session::{SessionContext, SessionHandle, SessionReport, SessionState, TransferSession};
pub use types::{Admission, NetworkStatus, UploadEvent, UploadObserver, UploadOutcome, UploadRequest};
