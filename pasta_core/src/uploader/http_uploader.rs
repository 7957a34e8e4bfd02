use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::UploadConfig;
use crate::progress::notifier::ProgressNotifier;
use crate::progress::observer::ProgressObserver;
use crate::types::types::{TransferMetadata, TransferReport, UploadError, UploadedChunk};
use crate::uploader::transfer_coordinator::{TransferCoordinator, TransferSettings};
use crate::uploader::transport::http_chunk_transport::HttpChunkTransport;

/// Capacity of the internal progress channel.
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Best-effort side effect run after every chunk uploaded successfully
/// (e.g. copying the URLs to the clipboard). A failing hook is logged and
/// never changes the reported outcome.
#[async_trait]
pub trait PostUploadHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_success(&self, uploaded: &[UploadedChunk]) -> Result<(), String>;
}

pub struct HttpUploader {
    coordinator: Arc<TransferCoordinator>,
    notifier: ProgressNotifier,
    hooks: Vec<Box<dyn PostUploadHook>>,
}

impl HttpUploader {
    pub fn new(coordinator: Arc<TransferCoordinator>) -> Self {
        Self {
            coordinator,
            notifier: ProgressNotifier::new(),
            hooks: Vec::new(),
        }
    }

    /// Uploader backed by the HTTP transport, using `config`'s endpoint.
    /// Returns the uploader and the metadata template to pass to `upload`.
    pub fn from_config(
        config: &UploadConfig,
        settings: TransferSettings,
    ) -> Result<(Self, TransferMetadata), UploadError> {
        let transport = Arc::new(HttpChunkTransport::new(settings.max_workers)?);
        let coordinator = Arc::new(TransferCoordinator::new(transport, settings));
        Ok((Self::new(coordinator), config.metadata()))
    }

    /// Register a progress observer. Must be called before `upload()`.
    pub fn add_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.notifier.add_observer(observer);
    }

    pub fn add_post_upload_hook(&mut self, hook: Box<dyn PostUploadHook>) {
        self.hooks.push(hook);
    }

    /// Run the full upload lifecycle.
    ///
    /// Internally creates the progress channel, injects the sender into the
    /// coordinator, runs the `ProgressNotifier` as a background task, then
    /// awaits it after the upload completes. Post-upload hooks only run when
    /// every chunk succeeded.
    pub async fn upload(
        &mut self,
        path: &Path,
        metadata: TransferMetadata,
    ) -> Result<TransferReport, UploadError> {
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        self.coordinator.set_progress_tx(progress_tx);

        // Observers registered so far go with this run.
        let notifier = std::mem::take(&mut self.notifier);
        let notifier_handle = tokio::spawn(async move {
            notifier.run(progress_rx).await;
        });

        let result = self.coordinator.upload(path, metadata).await;

        // Last sender gone: the notifier finishes and returns.
        self.coordinator.clear_progress_tx();
        if let Err(e) = notifier_handle.await {
            log::error!("[http_uploader] progress notifier failed: {}", e);
        }

        let report = result?;
        if report.outcome.is_success() {
            self.run_hooks(report.outcome.succeeded()).await;
        }
        Ok(report)
    }

    async fn run_hooks(&self, uploaded: &[UploadedChunk]) {
        for hook in &self.hooks {
            match hook.on_success(uploaded).await {
                Ok(()) => log::debug!("[http_uploader] hook `{}` done", hook.name()),
                Err(e) => log::warn!("[http_uploader] hook `{}` failed (ignored): {}", hook.name(), e),
            }
        }
    }
}
