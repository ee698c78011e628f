//! Data types shared by sessions and the coordinator.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::UploadError;

/// Terminal outcome of one upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Uploaded; carries the public retrieval URL.
    Success(String),
    /// Rejected or failed.
    Failure(UploadError),
    /// Aborted by the caller.
    Canceled,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success(_))
    }

    /// Retrieval URL on success.
    pub fn url(&self) -> Option<&str> {
        match self {
            UploadOutcome::Success(url) => Some(url),
            _ => None,
        }
    }

    /// Error on failure.
    pub fn error(&self) -> Option<&UploadError> {
        match self {
            UploadOutcome::Failure(e) => Some(e),
            _ => None,
        }
    }
}

/// Receives start/stop notifications for an upload request.
///
/// `on_stop` is called exactly once per admitted request. `on_start`
/// is called when a session begins working on the request, which never
/// happens for requests rejected at admission or cancelled while queued.
pub trait UploadObserver: Send + Sync {
    fn on_start(&self, _file: &Path) {}

    fn on_stop(&self, file: &Path, outcome: &UploadOutcome);
}

/// Notification delivered through a channel-backed observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Started {
        file: PathBuf,
    },
    Finished {
        file: PathBuf,
        outcome: UploadOutcome,
    },
}

impl UploadObserver for mpsc::UnboundedSender<UploadEvent> {
    fn on_start(&self, file: &Path) {
        let _ = self.send(UploadEvent::Started {
            file: file.to_path_buf(),
        });
    }

    fn on_stop(&self, file: &Path, outcome: &UploadOutcome) {
        let _ = self.send(UploadEvent::Finished {
            file: file.to_path_buf(),
            outcome: outcome.clone(),
        });
    }
}

/// One caller's intent to upload one file.
///
/// Several observers can hang off one request when the same path is
/// submitted more than once; all of them get the same outcome.
pub struct UploadRequest {
    file_path: PathBuf,
    file_size: u64,
    observers: Vec<Arc<dyn UploadObserver>>,
}

impl UploadRequest {
    pub fn new(file_path: PathBuf, file_size: u64, observer: Arc<dyn UploadObserver>) -> Self {
        Self {
            file_path,
            file_size,
            observers: vec![observer],
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Size recorded at admission.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn attach(&mut self, observer: Arc<dyn UploadObserver>) {
        self.observers.push(observer);
    }

    pub(crate) fn notify_start(&self) {
        for observer in &self.observers {
            observer.on_start(&self.file_path);
        }
    }

    /// Delivers the terminal outcome. Consumes the request so it cannot
    /// be finished twice.
    pub(crate) fn finish(self, outcome: &UploadOutcome) {
        for observer in &self.observers {
            observer.on_stop(&self.file_path, outcome);
        }
    }
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("file_path", &self.file_path)
            .field("file_size", &self.file_size)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// How `submit` disposed of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A session was started for it right away.
    Started,
    /// Appended to the pending queue.
    Queued,
    /// Same path already active or queued; the observer was attached.
    Joined,
    /// Over a size ceiling; the observer already got the failure.
    Rejected,
}

/// Online/offline flag shared between the host and the coordinator.
#[derive(Debug, Clone, Default)]
pub struct NetworkStatus {
    offline: Arc<AtomicBool>,
}

impl NetworkStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }
}
