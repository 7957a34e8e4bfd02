use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::progress::aggregator::{ChunkProgress, ProgressAggregator};
use crate::types::types::{
    ChunkDescriptor, ChunkError, ChunkOutcome, ChunkResult, FailedChunk, ProgressMessage,
    TransferMetadata, TransferOutcome, TransferReport, UploadError, UploadedChunk,
};
use crate::uploader::chunk_planner::{self, DEFAULT_CHUNK_SIZE};
use crate::uploader::transport::chunk_transport::ChunkTransport;

/// Default maximum number of concurrent chunk uploads.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// First retry delay; doubles per attempt up to 2^5 times this.
const BACKOFF_BASE_MS: u64 = 100;

type WorkQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkDescriptor>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: u64,
    pub max_workers: usize,
    /// Extra attempts for a chunk that failed with a retryable error.
    /// `0` disables retries.
    pub max_retries: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            max_retries: 0,
        }
    }
}

impl TransferSettings {
    fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidConfiguration(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(UploadError::InvalidConfiguration(
                "worker count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// State of one `upload()` call: the plan, one result slot per chunk, and the
/// shared progress counter.
struct TransferSession {
    id: String,
    chunks: Vec<ChunkDescriptor>,
    results: Vec<Option<ChunkResult>>,
    aggregator: Arc<ProgressAggregator>,
}

impl TransferSession {
    fn new(chunks: Vec<ChunkDescriptor>, aggregator: Arc<ProgressAggregator>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            results: vec![None; chunks.len()],
            chunks,
            aggregator,
        }
    }

    /// Stores a result in its slot and forwards it to progress subscribers.
    async fn record(&mut self, result: ChunkResult) {
        let index = result.index;
        let Some(slot) = self.results.get_mut(index) else {
            log::error!("[transfer_coordinator] session={}: result for unknown chunk {}", self.id, index);
            return;
        };
        if slot.is_some() {
            log::error!("[transfer_coordinator] session={}: duplicate result for chunk {}", self.id, index);
            return;
        }

        let message = match &result.outcome {
            ChunkOutcome::Success(url) => {
                // A successful chunk counts in full, whatever the transport reported.
                self.aggregator.report_chunk(index, self.chunks[index].length);
                ProgressMessage::ChunkUploaded {
                    event: self.aggregator.event_for(index),
                    url: url.clone(),
                }
            }
            ChunkOutcome::Failure(error) => {
                log::warn!(
                    "[transfer_coordinator] session={}: chunk {} failed after {} attempt(s): {}",
                    self.id, index, result.attempts, error
                );
                ProgressMessage::ChunkFailed {
                    event: self.aggregator.event_for(index),
                    error: error.to_string(),
                }
            }
        };

        *slot = Some(result);
        self.aggregator.notify(message).await;
    }

    /// Fills any slot whose worker died without reporting.
    async fn fill_missing(&mut self) {
        let missing: Vec<ChunkDescriptor> = self
            .chunks
            .iter()
            .filter(|c| self.results[c.index].is_none())
            .copied()
            .collect();

        for chunk in missing {
            let mut result = ChunkResult::failure(&chunk, ChunkError::WorkerLost, self.aggregator.chunk_snapshot(chunk.index));
            result.attempts = 0;
            self.record(result).await;
        }
    }

    /// Sorts results into the final outcome, ordered by chunk index.
    fn classify(&self) -> TransferOutcome {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for result in self.results.iter().flatten() {
            match &result.outcome {
                ChunkOutcome::Success(url) => succeeded.push(UploadedChunk {
                    index: result.index,
                    url: url.clone(),
                }),
                ChunkOutcome::Failure(error) => failed.push(FailedChunk {
                    index: result.index,
                    error: error.clone(),
                }),
            }
        }

        if failed.is_empty() {
            TransferOutcome::AllSucceeded(succeeded)
        } else {
            TransferOutcome::PartiallyFailed { succeeded, failed }
        }
    }
}

/// One member of the fixed-size pool. Holds its own file handle so reads of
/// unrelated ranges never serialize.
struct Worker {
    id: usize,
    path: PathBuf,
    source: Option<File>,
    transport: Arc<dyn ChunkTransport>,
    metadata: Arc<TransferMetadata>,
    aggregator: Arc<ProgressAggregator>,
    max_retries: u32,
}

impl Worker {
    async fn run(mut self, queue: WorkQueue, results: mpsc::UnboundedSender<ChunkResult>) {
        loop {
            let next = queue.lock().await.recv().await;
            let Some(chunk) = next else { break };

            log::debug!(
                "[transfer_coordinator] worker={}: chunk={} offset={} length={}",
                self.id, chunk.index, chunk.offset, chunk.length
            );

            let result = self.process(chunk).await;
            if results.send(result).is_err() {
                break;
            }
        }
        log::debug!("[transfer_coordinator] worker={}: queue drained", self.id);
    }

    async fn read_chunk(&mut self, chunk: &ChunkDescriptor) -> std::io::Result<Bytes> {
        if chunk.length == 0 {
            return Ok(Bytes::new());
        }

        let file = match self.source.take() {
            Some(file) => file,
            None => File::open(&self.path).await?,
        };
        let file = self.source.insert(file);

        file.seek(SeekFrom::Start(chunk.offset)).await?;
        let mut buf = vec![0u8; chunk.length as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn process(&mut self, chunk: ChunkDescriptor) -> ChunkResult {
        let bytes = match self.read_chunk(&chunk).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!(
                    "[transfer_coordinator] worker={}: cannot read chunk {}: {}",
                    self.id, chunk.index, e
                );
                let mut result = ChunkResult::failure(&chunk, ChunkError::SourceRead(e.to_string()), 0);
                result.attempts = 0;
                return result;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let progress = ChunkProgress::new(chunk.index, Arc::clone(&self.aggregator));
            let mut result = self
                .transport
                .send(&chunk, bytes.clone(), &self.metadata, progress)
                .await;
            result.attempts = attempt;

            if result.index != chunk.index {
                log::error!(
                    "[transfer_coordinator] worker={}: transport returned index {} for chunk {}",
                    self.id, result.index, chunk.index
                );
                result.index = chunk.index;
            }

            let retry = match &result.outcome {
                ChunkOutcome::Failure(error) => error.is_retryable() && attempt <= self.max_retries,
                ChunkOutcome::Success(_) => false,
            };
            if !retry {
                return result;
            }

            // Exponential backoff: 100ms, 200ms, 400ms, ...
            let delay_ms = BACKOFF_BASE_MS * (1u64 << (attempt - 1).min(5));
            log::info!(
                "[transfer_coordinator] worker={}: retrying chunk {} in {}ms (attempt {}/{})",
                self.id,
                chunk.index,
                delay_ms,
                attempt + 1,
                self.max_retries + 1
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }
}

/// Checks the source is a readable regular file and returns its size.
async fn inspect_source(path: &Path) -> Result<u64, UploadError> {
    let not_found = |source| UploadError::SourceNotFound {
        path: path.to_path_buf(),
        source,
    };

    let metadata = tokio::fs::metadata(path).await.map_err(not_found)?;
    if !metadata.is_file() {
        return Err(not_found(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    File::open(path).await.map_err(not_found)?;

    Ok(metadata.len())
}

/// Splits files into chunks and uploads them through a bounded worker pool.
pub struct TransferCoordinator {
    transport: Arc<dyn ChunkTransport>,
    settings: TransferSettings,
    progress_tx: Mutex<Option<mpsc::Sender<ProgressMessage>>>,
}

impl TransferCoordinator {
    pub fn new(transport: Arc<dyn ChunkTransport>, settings: TransferSettings) -> Self {
        Self {
            transport,
            settings,
            progress_tx: Mutex::new(None),
        }
    }

    /// Attach a progress subscriber for subsequent uploads. The receiver must
    /// be drained while an upload runs.
    pub fn set_progress_tx(&self, tx: mpsc::Sender<ProgressMessage>) {
        if let Ok(mut guard) = self.progress_tx.lock() {
            *guard = Some(tx);
        }
    }

    /// Drop the progress sender so the subscriber's channel can close.
    pub fn clear_progress_tx(&self) {
        if let Ok(mut guard) = self.progress_tx.lock() {
            *guard = None;
        }
    }

    /// Uploads `path` chunk by chunk.
    ///
    /// Returns `Err` only for precondition failures, before any request is
    /// made. Per-chunk failures are collected and classified once every chunk
    /// has a result; in-flight chunks are never cancelled because another one
    /// failed.
    pub async fn upload(
        &self,
        path: &Path,
        metadata: TransferMetadata,
    ) -> Result<TransferReport, UploadError> {
        self.settings.validate()?;
        let file_size = inspect_source(path).await?;
        let chunks = chunk_planner::plan(file_size, self.settings.chunk_size)?;

        let mut metadata = metadata.with_chunk_total(chunks.len());
        if metadata.original_name.is_none() {
            metadata.original_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }
        let metadata = Arc::new(metadata);

        let progress_tx = self.progress_tx.lock().ok().and_then(|guard| guard.clone());
        let aggregator = Arc::new(ProgressAggregator::new(&chunks).with_sender(progress_tx));
        let mut session = TransferSession::new(chunks, Arc::clone(&aggregator));

        let worker_count = self.settings.max_workers.min(session.chunks.len());
        log::info!(
            "[transfer_coordinator] session={}: {} ({} bytes) -> {} chunk(s) of {} bytes, {} worker(s)",
            session.id,
            path.display(),
            file_size,
            session.chunks.len(),
            self.settings.chunk_size,
            worker_count
        );

        let start = Instant::now();

        // Bounded queue: at most `max_workers` chunks wait beyond those in flight.
        let (work_tx, work_rx) = mpsc::channel::<ChunkDescriptor>(self.settings.max_workers);
        let work_rx: WorkQueue = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ChunkResult>();

        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker = Worker {
                id,
                path: path.to_path_buf(),
                source: None,
                transport: Arc::clone(&self.transport),
                metadata: Arc::clone(&metadata),
                aggregator: Arc::clone(&aggregator),
                max_retries: self.settings.max_retries,
            };
            handles.push(tokio::spawn(worker.run(Arc::clone(&work_rx), result_tx.clone())));
        }
        drop(result_tx);
        drop(work_rx);

        // Feed the queue in index order while results drain as they arrive.
        let queued = session.chunks.clone();
        let feed = async move {
            for chunk in queued {
                if work_tx.send(chunk).await.is_err() {
                    log::error!("[transfer_coordinator] all workers exited before the queue was drained");
                    break;
                }
            }
        };
        let collect = async {
            while let Some(result) = result_rx.recv().await {
                session.record(result).await;
            }
        };
        tokio::join!(feed, collect);

        for handle in handles {
            if let Err(join_err) = handle.await {
                log::error!("[transfer_coordinator] session={}: worker task failed: {}", session.id, join_err);
            }
        }

        session.fill_missing().await;
        let outcome = session.classify();
        let elapsed = start.elapsed();
        let bytes_transferred = aggregator.snapshot();

        match &outcome {
            TransferOutcome::AllSucceeded(chunks) => log::info!(
                "[transfer_coordinator] session={}: all {} chunk(s) uploaded in {:.2}s",
                session.id,
                chunks.len(),
                elapsed.as_secs_f64()
            ),
            TransferOutcome::PartiallyFailed { succeeded, failed } => log::warn!(
                "[transfer_coordinator] session={}: {} chunk(s) failed, {} uploaded, in {:.2}s",
                session.id,
                failed.len(),
                succeeded.len(),
                elapsed.as_secs_f64()
            ),
        }

        Ok(TransferReport {
            session_id: session.id.clone(),
            outcome,
            file_size,
            chunk_count: session.chunks.len(),
            bytes_transferred,
            elapsed,
        })
    }
}
