//! transfer.sh provider.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use cloudfile_upload::{
    Admission, ConfigError, CoordinatorHandle, NetworkStatus, UploadConfig, UploadCoordinator,
    UploadError, UploadObserver, UploadOutcome,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::provider::{CloudFileProvider, LastError};

pub const TYPE_NAME: &str = "TransferSh";
pub const DISPLAY_NAME: &str = "Transfer.sh";

#[derive(Debug, Default)]
struct ProviderState {
    config: RwLock<UploadConfig>,
    /// Held across read, change and apply of the config.
    updates: Mutex<()>,
    urls: RwLock<HashMap<PathBuf, String>>,
    last_error: RwLock<Option<LastError>>,
}

impl ProviderState {
    fn record_url(&self, file: &Path, url: &str) {
        self.urls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file.to_path_buf(), url.to_string());
    }

    fn record_error(&self, error: &UploadError) {
        *self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(LastError::from(error));
    }

    fn config(&self) -> UploadConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Wraps the host's observer to keep the URL registry and last error
/// current before forwarding.
struct RecordingObserver {
    state: Arc<ProviderState>,
    inner: Arc<dyn UploadObserver>,
}

impl UploadObserver for RecordingObserver {
    fn on_start(&self, file: &Path) {
        self.inner.on_start(file);
    }

    fn on_stop(&self, file: &Path, outcome: &UploadOutcome) {
        match outcome {
            UploadOutcome::Success(url) => self.state.record_url(file, url),
            UploadOutcome::Failure(e) => self.state.record_error(e),
            UploadOutcome::Canceled => {}
        }
        self.inner.on_stop(file, outcome);
    }
}

/// Uploads files to transfer.sh (or a compatible server).
#[derive(Debug, Clone)]
pub struct TransferShProvider {
    coordinator: CoordinatorHandle,
    state: Arc<ProviderState>,
}

impl TransferShProvider {
    /// Starts the upload coordinator. Must be called within a Tokio runtime.
    pub fn new(config: UploadConfig, network: NetworkStatus) -> Result<Self, ConfigError> {
        let coordinator = UploadCoordinator::spawn(config.clone(), network)?;
        info!(endpoint = %config.base_url, "transfer.sh provider ready");
        Ok(Self {
            coordinator,
            state: Arc::new(ProviderState {
                config: RwLock::new(config),
                ..Default::default()
            }),
        })
    }

    /// Builds the provider for one account of an accounts document.
    pub fn from_account(
        path: &Path,
        account: &str,
        network: NetworkStatus,
    ) -> Result<Self, ConfigError> {
        let config = UploadConfig::load_account(path, account)?;
        Self::new(config, network)
    }

    pub fn network(&self) -> &NetworkStatus {
        self.coordinator.network()
    }

    /// Points the provider at other endpoints. Only the first entry is
    /// used; an empty list leaves the configuration unchanged.
    pub async fn override_urls(&self, urls: &[String]) -> Result<(), UploadError> {
        let Some(url) = urls.first() else {
            return Ok(());
        };
        debug!(endpoint = %url, "overriding upload endpoint");
        self.update(|config| config.base_url = url.clone()).await
    }

    /// Sets or clears the account ceiling.
    pub async fn set_account_limit(&self, limit: Option<u64>) -> Result<(), UploadError> {
        self.update(|config| config.account_limit = limit).await
    }

    /// Changes one copy of the config and hands it to the coordinator.
    /// Updates are serialized so concurrent callers never drop each
    /// other's changes.
    async fn update(&self, change: impl FnOnce(&mut UploadConfig)) -> Result<(), UploadError> {
        let _guard = self.state.updates.lock().await;
        let mut config = self.state.config();
        change(&mut config);
        self.coordinator.reconfigure(config.clone()).await?;
        *self
            .state
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }
}

impl CloudFileProvider for TransferShProvider {
    fn type_name(&self) -> &str {
        TYPE_NAME
    }

    fn display_name(&self) -> &str {
        DISPLAY_NAME
    }

    fn service_url(&self) -> String {
        self.state.config().base_url
    }

    fn upload_file(
        &self,
        file: PathBuf,
        observer: Arc<dyn UploadObserver>,
    ) -> Pin<Box<dyn Future<Output = Result<Admission, UploadError>> + Send + '_>> {
        Box::pin(async move {
            let observer = Arc::new(RecordingObserver {
                state: self.state.clone(),
                inner: observer,
            });
            let result = self.coordinator.submit(file, observer).await;
            if let Err(e) = &result {
                self.state.record_error(e);
            }
            result
        })
    }

    fn cancel_file_upload(
        &self,
        file: PathBuf,
    ) -> Pin<Box<dyn Future<Output = Result<bool, UploadError>> + Send + '_>> {
        Box::pin(async move { self.coordinator.cancel(file).await })
    }

    fn url_for_file(&self, file: &Path) -> Option<String> {
        self.state
            .urls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file)
            .cloned()
    }

    fn provider_url_for_error(&self, _error: &UploadError) -> String {
        self.service_url()
    }

    fn last_error(&self) -> Option<LastError> {
        self.state
            .last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn file_upload_size_limit(&self) -> u64 {
        self.state.config().effective_limit()
    }
}
