//! Single-flight upload coordinator.
//!
//! Requests are admitted in submission order. At most one
//! [`TransferSession`] runs at a time; when it reports, the next pending
//! request is started. The coordinator runs as a task and is driven
//! through a cloneable [`CoordinatorHandle`], so every queue mutation
//! happens on one task and needs no locking.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, UploadConfig};
use crate::error::UploadError;
use crate::session::{SessionContext, SessionHandle, SessionReport, SessionState, TransferSession};
use crate::types::{Admission, NetworkStatus, UploadObserver, UploadOutcome, UploadRequest};

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    Submit {
        file: PathBuf,
        size: u64,
        observer: Arc<dyn UploadObserver>,
        reply: oneshot::Sender<Admission>,
    },
    Cancel {
        file: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    Reconfigure {
        config: UploadConfig,
        context: SessionContext,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<CoordinatorSnapshot>,
    },
}

/// The upload currently on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUpload {
    pub session_id: u64,
    pub file: PathBuf,
    pub state: SessionState,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub active: Option<ActiveUpload>,
    /// Queued paths, head first.
    pub pending: Vec<PathBuf>,
}

impl CoordinatorSnapshot {
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}

/// Cloneable entry point to a running coordinator.
///
/// The coordinator stops once every handle is dropped; queued requests
/// are then reported as canceled and the active session is aborted.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    network: NetworkStatus,
}

impl CoordinatorHandle {
    /// Submits `file` for upload.
    ///
    /// Fails without touching `observer` when offline or when the file
    /// cannot be read. Otherwise `observer` will see exactly one
    /// `on_stop`; for [`Admission::Rejected`] it has already happened
    /// by the time this returns.
    pub async fn submit(
        &self,
        file: impl Into<PathBuf>,
        observer: Arc<dyn UploadObserver>,
    ) -> Result<Admission, UploadError> {
        let file = file.into();
        if self.network.is_offline() {
            warn!(file = %file.display(), "upload refused while offline");
            return Err(UploadError::Offline);
        }

        let metadata = tokio::fs::metadata(&file)
            .await
            .map_err(|e| UploadError::Staging(format!("{}: {e}", file.display())))?;
        if !metadata.is_file() {
            return Err(UploadError::Staging(format!(
                "{} is not a regular file",
                file.display()
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            file,
            size: metadata.len(),
            observer,
            reply,
        })?;
        rx.await.map_err(|_| UploadError::Coordinator)
    }

    /// Cancels the upload of `file`, whether active or queued.
    ///
    /// Returns `false` if nothing is known about the path.
    pub async fn cancel(&self, file: impl AsRef<Path>) -> Result<bool, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            file: file.as_ref().to_path_buf(),
            reply,
        })?;
        rx.await.map_err(|_| UploadError::Coordinator)
    }

    /// Replaces the configuration used by sessions started from now on.
    /// The active session, if any, keeps the settings it started with.
    pub async fn reconfigure(&self, config: UploadConfig) -> Result<(), UploadError> {
        let context = SessionContext::new(&config)?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reconfigure {
            config,
            context,
            reply,
        })?;
        rx.await.map_err(|_| UploadError::Coordinator)
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| UploadError::Coordinator)
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    fn send(&self, command: Command) -> Result<(), UploadError> {
        self.commands
            .send(command)
            .map_err(|_| UploadError::Coordinator)
    }
}

// ---------------------------------------------------------------------------
// Coordinator task
// ---------------------------------------------------------------------------

struct ActiveSession {
    handle: SessionHandle,
    /// Observers that submitted the same path after the session started.
    joined: Vec<Arc<dyn UploadObserver>>,
}

/// Owns the pending queue and the active session.
pub struct UploadCoordinator {
    config: UploadConfig,
    context: SessionContext,
    active: Option<ActiveSession>,
    pending: VecDeque<UploadRequest>,
    finished_tx: mpsc::UnboundedSender<SessionReport>,
    next_id: u64,
}

impl UploadCoordinator {
    /// Starts a coordinator task and returns its handle.
    pub fn spawn(
        config: UploadConfig,
        network: NetworkStatus,
    ) -> Result<CoordinatorHandle, ConfigError> {
        let context = SessionContext::new(&config)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();

        info!(endpoint = %config.base_url, "upload coordinator started");

        let coordinator = Self {
            config,
            context,
            active: None,
            pending: VecDeque::new(),
            finished_tx,
            next_id: 1,
        };
        tokio::spawn(coordinator.run(commands_rx, finished_rx));

        Ok(CoordinatorHandle {
            commands: commands_tx,
            network,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut finished: mpsc::UnboundedReceiver<SessionReport>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(report) = finished.recv() => self.on_session_finished(report),
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        self.shutdown(&mut finished).await;
        info!("upload coordinator stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit {
                file,
                size,
                observer,
                reply,
            } => {
                let admission = self.admit(file, size, observer);
                let _ = reply.send(admission);
            }
            Command::Cancel { file, reply } => {
                let found = self.cancel(&file);
                let _ = reply.send(found);
            }
            Command::Reconfigure {
                config,
                context,
                reply,
            } => {
                info!(endpoint = %config.base_url, limit = config.effective_limit(), "upload settings changed");
                self.config = config;
                self.context = context;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn admit(&mut self, file: PathBuf, size: u64, observer: Arc<dyn UploadObserver>) -> Admission {
        if let Err(e) = self.config.check_size(size) {
            warn!(file = %file.display(), size, error = %e, "upload rejected");
            observer.on_stop(&file, &UploadOutcome::Failure(e));
            return Admission::Rejected;
        }

        if let Some(active) = self.active.as_mut()
            && active.handle.file() == file
        {
            debug!(file = %file.display(), "joined active upload");
            observer.on_start(&file);
            active.joined.push(observer);
            return Admission::Joined;
        }

        if let Some(queued) = self.pending.iter_mut().find(|r| r.file_path() == file) {
            debug!(file = %file.display(), "joined queued upload");
            queued.attach(observer);
            return Admission::Joined;
        }

        let request = UploadRequest::new(file, size, observer);
        if self.active.is_some() {
            info!(
                file = %request.file_path().display(),
                position = self.pending.len() + 1,
                "upload queued"
            );
            self.pending.push_back(request);
            Admission::Queued
        } else {
            self.start_session(request);
            Admission::Started
        }
    }

    fn cancel(&mut self, file: &Path) -> bool {
        if let Some(active) = &self.active
            && active.handle.file() == file
        {
            info!(file = %file.display(), session = active.handle.id(), "cancelling active upload");
            active.handle.cancel();
            return true;
        }

        if let Some(pos) = self.pending.iter().position(|r| r.file_path() == file) {
            if let Some(request) = self.pending.remove(pos) {
                info!(file = %file.display(), "cancelled queued upload");
                request.finish(&UploadOutcome::Canceled);
            }
            return true;
        }

        debug!(file = %file.display(), "cancel for unknown upload");
        false
    }

    fn on_session_finished(&mut self, report: SessionReport) {
        let SessionReport {
            id,
            mut request,
            outcome,
        } = report;

        match self.active.take() {
            Some(active) if active.handle.id() == id => {
                for observer in active.joined {
                    request.attach(observer);
                }
            }
            other => {
                warn!(session = id, "report from a session that is not active");
                self.active = other;
            }
        }

        debug!(
            session = id,
            file = %request.file_path().display(),
            observers = request.observer_count(),
            success = outcome.is_success(),
            "delivering upload outcome"
        );
        request.finish(&outcome);

        if self.active.is_none() {
            self.start_next();
        }
    }

    /// Starts the first pending request that still fits the ceilings.
    ///
    /// Limits may have been lowered by `reconfigure` while a request was
    /// queued, so each one is checked again before its session starts.
    fn start_next(&mut self) {
        while let Some(next) = self.pending.pop_front() {
            if let Err(e) = self.config.check_size(next.file_size()) {
                warn!(
                    file = %next.file_path().display(),
                    size = next.file_size(),
                    error = %e,
                    "queued upload rejected"
                );
                next.finish(&UploadOutcome::Failure(e));
                continue;
            }
            info!(
                file = %next.file_path().display(),
                remaining = self.pending.len(),
                "starting next queued upload"
            );
            self.start_session(next);
            return;
        }
    }

    fn start_session(&mut self, request: UploadRequest) {
        let id = self.next_id;
        self.next_id += 1;

        request.notify_start();
        let session = TransferSession::new(id, request, self.context.clone());
        let handle = session.start(self.finished_tx.clone());
        self.active = Some(ActiveSession {
            handle,
            joined: Vec::new(),
        });
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            active: self.active.as_ref().map(|a| ActiveUpload {
                session_id: a.handle.id(),
                file: a.handle.file().to_path_buf(),
                state: a.handle.state(),
            }),
            pending: self
                .pending
                .iter()
                .map(|r| r.file_path().to_path_buf())
                .collect(),
        }
    }

    async fn shutdown(&mut self, finished: &mut mpsc::UnboundedReceiver<SessionReport>) {
        for request in self.pending.drain(..) {
            request.finish(&UploadOutcome::Canceled);
        }
        if let Some(active) = &self.active {
            active.handle.cancel();
        }
        while self.active.is_some() {
            match finished.recv().await {
                Some(report) => self.on_session_finished(report),
                None => break,
            }
        }
    }
}
