//! A single upload: stage the multipart body, POST it, read the URL back.
//!
//! The session owns its staging file from creation to deletion. Every
//! exit path (success, HTTP failure, transport error, timeout,
//! cancellation, staging failure) removes the file before the session
//! reaches a terminal state and reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudfile_staging::{StagedBody, StagingError, StagingOptions, stage_multipart};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, DATE, LOCATION};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, UploadConfig};
use crate::error::UploadError;
use crate::response::{parse_descriptor, truncate_body};
use crate::types::{UploadOutcome, UploadRequest};

/// Lifecycle of a transfer session.
///
/// `Preparing` covers staging; `Sending` starts when the HTTP request is
/// issued. `Completed`, `Failed` and `Canceled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Preparing,
    Sending,
    Completed,
    Failed,
    Canceled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Canceled
        )
    }

    /// Transition table.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Preparing, Sending)
                | (Preparing, Failed)
                | (Preparing, Canceled)
                | (Sending, Completed)
                | (Sending, Failed)
                | (Sending, Canceled)
        )
    }

    fn for_outcome(outcome: &UploadOutcome) -> Self {
        match outcome {
            UploadOutcome::Success(_) => SessionState::Completed,
            UploadOutcome::Failure(_) => SessionState::Failed,
            UploadOutcome::Canceled => SessionState::Canceled,
        }
    }
}

/// Everything a session needs from the configuration.
#[derive(Debug, Clone)]
pub struct SessionContext {
    http: reqwest::Client,
    endpoint: String,
    idle_timeout: Duration,
    staging: StagingOptions,
}

impl SessionContext {
    /// Builds the HTTP client and staging options for `config`.
    ///
    /// Redirects are not followed: a 3xx answer is the service's reply.
    /// There is no overall deadline; a session fails with a timeout only
    /// when the exchange stalls for the idle timeout.
    pub fn new(config: &UploadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.idle_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("cloudfile/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            endpoint: config.base_url.clone(),
            idle_timeout: config.idle_timeout(),
            staging: StagingOptions {
                dir: config.staging_dir.clone(),
                chunk_size: config.chunk_size,
            },
        })
    }
}

/// What a finished session hands back to whoever started it.
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub request: UploadRequest,
    pub outcome: UploadOutcome,
}

/// Cheap, cloneable view of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    file: PathBuf,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Requests cancellation. Returns immediately; the session reports
    /// `Canceled` once it has released its resources.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// One upload of one file.
pub struct TransferSession {
    id: u64,
    request: UploadRequest,
    context: SessionContext,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl TransferSession {
    pub fn new(id: u64, request: UploadRequest, context: SessionContext) -> Self {
        let (state, _) = watch::channel(SessionState::Preparing);
        Self {
            id,
            request,
            context,
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            file: self.request.file_path().to_path_buf(),
            cancel: self.cancel.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Cancels before or during the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Spawns the session and sends its report to `finished` when done.
    ///
    /// Takes `self` by value: a session can only be started once.
    pub fn start(self, finished: mpsc::UnboundedSender<SessionReport>) -> SessionHandle {
        let handle = self.handle();
        tokio::spawn(async move {
            let report = self.run().await;
            if finished.send(report).is_err() {
                warn!("session finished after its coordinator stopped");
            }
        });
        handle
    }

    /// Runs the session to a terminal state.
    pub async fn run(self) -> SessionReport {
        let outcome = self.execute().await;
        SessionReport {
            id: self.id,
            request: self.request,
            outcome,
        }
    }

    async fn execute(&self) -> UploadOutcome {
        let file = self.request.file_path();
        info!(
            session = self.id,
            file = %file.display(),
            size = self.request.file_size(),
            "upload session started"
        );

        let staged = match self.stage().await {
            Ok(staged) => staged,
            Err(StagingError::Cancelled) => {
                info!(session = self.id, "upload cancelled while staging");
                self.transition(SessionState::Canceled);
                return UploadOutcome::Canceled;
            }
            Err(e) => {
                error!(session = self.id, file = %file.display(), error = %e, "staging failed");
                self.transition(SessionState::Failed);
                return UploadOutcome::Failure(e.into());
            }
        };

        if self.cancel.is_cancelled() {
            self.release(staged);
            self.transition(SessionState::Canceled);
            return UploadOutcome::Canceled;
        }

        self.transition(SessionState::Sending);
        let outcome = self.send(&staged).await;
        self.release(staged);
        self.transition(SessionState::for_outcome(&outcome));

        match &outcome {
            UploadOutcome::Success(url) => info!(session = self.id, %url, "upload completed"),
            UploadOutcome::Failure(e) => error!(session = self.id, error = %e, "upload failed"),
            UploadOutcome::Canceled => info!(session = self.id, "upload aborted"),
        }
        outcome
    }

    /// Copies the source into a staging file on a blocking thread.
    async fn stage(&self) -> Result<StagedBody, StagingError> {
        let source = self.request.file_path().to_path_buf();
        let options = self.context.staging.clone();
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || stage_multipart(&source, &options, &cancel))
            .await
            .map_err(|e| StagingError::Io(std::io::Error::other(format!("staging task: {e}"))))?
    }

    async fn send(&self, staged: &StagedBody) -> UploadOutcome {
        let progress = Progress::new();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => UploadOutcome::Canceled,
            _ = progress.stalled(self.context.idle_timeout) => {
                warn!(session = self.id, idle = ?self.context.idle_timeout, "upload stalled");
                UploadOutcome::Failure(UploadError::Timeout)
            }
            result = self.exchange(staged, &progress) => match result {
                Ok(url) => UploadOutcome::Success(url),
                Err(e) => UploadOutcome::Failure(e),
            },
        }
    }

    /// Streams the staged body and interprets the reply.
    async fn exchange(
        &self,
        staged: &StagedBody,
        progress: &Progress,
    ) -> Result<String, UploadError> {
        let reader = tokio::fs::File::from_std(staged.open_reader()?);
        let stream = ReaderStream::new(reader).inspect({
            let progress = progress.clone();
            move |_| progress.touch()
        });
        let body = reqwest::Body::wrap_stream(stream);

        debug!(
            session = self.id,
            url = %self.context.endpoint,
            bytes = staged.len(),
            "posting multipart body"
        );

        let response = self
            .context
            .http
            .post(&self.context.endpoint)
            .header(CONTENT_TYPE, staged.content_type())
            .header(CONTENT_LENGTH, staged.len())
            .header(DATE, http_date(Utc::now()))
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;
        progress.touch();

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await.map_err(transport_error)?;

        debug!(session = self.id, status = status.as_u16(), "upload response");

        if status.is_success() || status.is_redirection() {
            parse_descriptor(&text, location.as_deref())
        } else {
            Err(UploadError::Http {
                status: status.as_u16(),
                body: truncate_body(&text),
            })
        }
    }

    fn release(&self, staged: StagedBody) {
        let path = staged.path().to_path_buf();
        if let Err(e) = staged.close() {
            warn!(
                session = self.id,
                path = %path.display(),
                error = %e,
                "failed to remove staging file"
            );
        }
    }

    fn transition(&self, next: SessionState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            warn!(session = self.id, from = ?current, to = ?next, "illegal session transition");
            return;
        }
        self.state.send_replace(next);
        debug!(session = self.id, from = ?current, to = ?next, "session state");
    }
}

/// Time of the last byte moved by an exchange.
#[derive(Debug, Clone)]
struct Progress {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Progress {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Resolves once nothing has moved for `limit`.
    async fn stalled(&self, limit: Duration) {
        loop {
            let idle = self.idle();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}

fn transport_error(e: reqwest::Error) -> UploadError {
    if e.is_timeout() {
        UploadError::Timeout
    } else {
        UploadError::Transport(e.to_string())
    }
}

/// Formats an RFC 7231 `Date` header value.
fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServer, Reply, dir_is_empty, observer, test_config};
    use chrono::TimeZone;
    use percent_encoding::percent_decode_str;
    use std::time::Duration;

    fn session_for(path: &Path, config: &UploadConfig) -> TransferSession {
        let (obs, _rx) = observer();
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let request = UploadRequest::new(path.to_path_buf(), size, obs);
        TransferSession::new(1, request, SessionContext::new(config).unwrap())
    }

    #[test]
    fn transition_table() {
        use SessionState::*;
        assert!(Preparing.can_transition_to(Sending));
        assert!(Preparing.can_transition_to(Canceled));
        assert!(Sending.can_transition_to(Completed));
        assert!(!Preparing.can_transition_to(Completed));
        assert!(!Sending.can_transition_to(Preparing));
        for terminal in [Completed, Failed, Canceled] {
            assert!(terminal.is_terminal());
            for next in [Preparing, Sending, Completed, Failed, Canceled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clock_resets_on_progress() {
        let progress = Progress::new();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(progress.idle(), Duration::from_millis(200));

        progress.touch();
        assert_eq!(progress.idle(), Duration::ZERO);

        let limit = Duration::from_millis(300);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(40), progress.stalled(limit))
                .await
                .is_err()
        );
        progress.touch();
        assert!(
            tokio::time::timeout(Duration::from_millis(290), progress.stalled(limit))
                .await
                .is_err()
        );
        tokio::time::timeout(Duration::from_millis(20), progress.stalled(limit))
            .await
            .unwrap();
    }

    #[test]
    fn date_header_format() {
        let t = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(http_date(t), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[tokio::test]
    async fn successful_upload_sends_multipart_and_returns_url() {
        let mut server =
            MockServer::start(vec![Reply::ok("https://transfer.sh/Ab12/cafe.bin\n")]).await;
        let src_dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let name = "naïve café.bin";
        let path = src_dir.path().join(name);
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let config = test_config(&server.url, staging.path());
        let session = session_for(&path, &config);
        let report = session.run().await;

        assert_eq!(
            report.outcome,
            UploadOutcome::Success("https://transfer.sh/Ab12/cafe.bin".into())
        );
        assert!(dir_is_empty(staging.path()));

        let req = server.next_request().await;
        assert_eq!(req.method, "POST");
        assert!(req.headers["date"].ends_with("GMT"));
        let content_type = &req.headers["content-type"];
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap()
            .to_string();

        let body = req.body;
        let stream = futures_util::stream::once(async move {
            Ok::<_, std::io::Error>(bytes::Bytes::from(body))
        });
        let mut multipart = multer::Multipart::new(stream, boundary);
        let field = multipart.next_field().await.unwrap().unwrap();
        let file_name = percent_decode_str(field.file_name().unwrap())
            .decode_utf8()
            .unwrap()
            .into_owned();
        assert_eq!(file_name, name);
        assert_eq!(&field.bytes().await.unwrap()[..], &data[..]);
    }

    #[tokio::test]
    async fn error_status_is_failure_with_detail() {
        let server = MockServer::start(vec![Reply::status(500, "disk full")]).await;
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let report = session_for(&path, &test_config(&server.url, staging.path()))
            .run()
            .await;

        assert_eq!(
            report.outcome,
            UploadOutcome::Failure(UploadError::Http {
                status: 500,
                body: "disk full".into()
            })
        );
        assert!(dir_is_empty(staging.path()));
    }

    #[tokio::test]
    async fn redirect_counts_as_success() {
        let server = MockServer::start(vec![Reply::redirect("https://h.example/r/a.txt")]).await;
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let report = session_for(&path, &test_config(&server.url, staging.path()))
            .run()
            .await;

        assert_eq!(report.outcome.url(), Some("https://h.example/r/a.txt"));
    }

    #[tokio::test]
    async fn unparseable_success_body_is_failure() {
        let server = MockServer::start(vec![Reply::ok("")]).await;
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let report = session_for(&path, &test_config(&server.url, staging.path()))
            .run()
            .await;

        assert!(matches!(
            report.outcome,
            UploadOutcome::Failure(UploadError::InvalidResponse(_))
        ));
        assert!(dir_is_empty(staging.path()));
    }

    #[tokio::test]
    async fn hanging_server_times_out() {
        let server = MockServer::start(vec![Reply::Hang]).await;
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let mut config = test_config(&server.url, staging.path());
        config.idle_timeout_ms = 300;
        let report = session_for(&path, &config).run().await;

        assert_eq!(report.outcome, UploadOutcome::Failure(UploadError::Timeout));
        assert!(dir_is_empty(staging.path()));
    }

    #[tokio::test]
    async fn cancel_while_sending() {
        let mut server = MockServer::start(vec![Reply::Hang]).await;
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let session = session_for(&path, &test_config(&server.url, staging.path()));
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
        let handle = session.start(finished_tx);

        server.next_request().await;
        assert_eq!(handle.state(), SessionState::Sending);
        handle.cancel();

        let report = tokio::time::timeout(Duration::from_secs(10), finished_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, UploadOutcome::Canceled);
        assert_eq!(handle.state(), SessionState::Canceled);
        assert!(dir_is_empty(staging.path()));
    }

    #[tokio::test]
    async fn cancel_before_start_never_touches_network() {
        let server = MockServer::start(vec![Reply::ok("https://x.example/a")]).await;
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let session = session_for(&path, &test_config(&server.url, staging.path()));
        let handle = session.handle();
        session.cancel();
        let report = session.run().await;

        assert_eq!(report.outcome, UploadOutcome::Canceled);
        assert_eq!(handle.state(), SessionState::Canceled);
        assert_eq!(server.connections(), 0);
        assert!(dir_is_empty(staging.path()));
    }

    #[tokio::test]
    async fn missing_source_is_staging_failure() {
        let server = MockServer::start(vec![]).await;
        let staging = tempfile::tempdir().unwrap();
        let config = test_config(&server.url, staging.path());

        let (obs, _rx) = observer();
        let request = UploadRequest::new("/nonexistent/cloudfile/x.bin".into(), 1, obs);
        let session = TransferSession::new(7, request, SessionContext::new(&config).unwrap());
        let handle = session.handle();
        let report = session.run().await;

        assert_eq!(report.id, 7);
        assert!(matches!(
            report.outcome,
            UploadOutcome::Failure(UploadError::Staging(_))
        ));
        assert_eq!(handle.state(), SessionState::Failed);
        assert_eq!(server.connections(), 0);
    }

    #[tokio::test]
    async fn refused_connection_is_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let report = session_for(&path, &test_config(&url, staging.path()))
            .run()
            .await;

        assert!(matches!(
            report.outcome,
            UploadOutcome::Failure(UploadError::Transport(_))
        ));
        assert!(dir_is_empty(staging.path()));
    }

    #[tokio::test]
    async fn report_returns_request_with_observers() {
        let server = MockServer::start(vec![Reply::ok("https://x.example/a")]).await;
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let (obs, mut rx) = observer();
        let request = UploadRequest::new(path.clone(), 3, obs);
        let context = SessionContext::new(&test_config(&server.url, staging.path())).unwrap();
        let report = TransferSession::new(1, request, context).run().await;

        // Sessions never notify observers themselves.
        assert!(rx.try_recv().is_err());
        assert_eq!(report.request.file_path(), path.as_path());
        report.request.finish(&report.outcome);
        assert!(rx.try_recv().is_ok());
    }
}
