use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use pasta_core::progress::ChunkProgress;
use pasta_core::types::types::{
    ChunkDescriptor, ChunkError, ChunkResult, ProgressMessage, TransferMetadata, TransferOutcome,
    UploadError,
};
use pasta_core::uploader::transfer_coordinator::{TransferCoordinator, TransferSettings};
use pasta_core::uploader::transport::chunk_transport::ChunkTransport;

const MB: u64 = 1024 * 1024;

/// Creates a temp file with deterministic content of `size` bytes.
fn create_source_file(size: u64) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

fn metadata() -> TransferMetadata {
    TransferMetadata::new("http://unused.invalid/api/upload", "token").with_original_name("movie.mp4")
}

fn settings(chunk_size: u64, max_workers: usize) -> TransferSettings {
    TransferSettings {
        chunk_size,
        max_workers,
        max_retries: 0,
    }
}

/// Scripted transport: records what it was sent and fails the chunks it is
/// told to.
#[derive(Default)]
struct MockTransport {
    /// Chunks that always fail with a connection reset.
    fail: HashSet<usize>,
    /// Chunks that fail this many times before succeeding.
    flaky: Mutex<HashMap<usize, u32>>,
    /// Per-chunk artificial latency.
    delays: HashMap<usize, Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    attempts: Mutex<HashMap<usize, u32>>,
    received: Mutex<HashMap<usize, Bytes>>,
    chunk_totals: Mutex<HashSet<usize>>,
    names: Mutex<HashSet<String>>,
}

impl MockTransport {
    fn failing(indices: &[usize]) -> Self {
        Self {
            fail: indices.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn attempts_for(&self, index: usize) -> u32 {
        self.attempts.lock().unwrap().get(&index).copied().unwrap_or(0)
    }

    fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ChunkTransport for MockTransport {
    async fn send(
        &self,
        chunk: &ChunkDescriptor,
        bytes: Bytes,
        metadata: &TransferMetadata,
        progress: ChunkProgress,
    ) -> ChunkResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        *self.attempts.lock().unwrap().entry(chunk.index).or_insert(0) += 1;
        self.chunk_totals.lock().unwrap().insert(metadata.chunk_total);
        if let Some(name) = &metadata.original_name {
            self.names.lock().unwrap().insert(name.clone());
        }

        let delay = self.delays.get(&chunk.index).copied().unwrap_or(Duration::from_millis(5));
        tokio::time::sleep(delay).await;

        // Send half, then decide.
        let half = bytes.len() as u64 / 2;
        progress.advance(half);

        let transient = {
            let mut flaky = self.flaky.lock().unwrap();
            match flaky.get_mut(&chunk.index) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };

        let result = if self.fail.contains(&chunk.index) || transient {
            ChunkResult::failure(chunk, ChunkError::NetworkError("connection reset".to_string()), half)
        } else {
            progress.advance(bytes.len() as u64 - half);
            self.received.lock().unwrap().insert(chunk.index, bytes);
            ChunkResult::success(chunk, format!("https://files.example/u/movie.mp4.part{:03}", chunk.index))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn coordinator(transport: &Arc<MockTransport>, settings: TransferSettings) -> TransferCoordinator {
    TransferCoordinator::new(Arc::clone(transport) as Arc<dyn ChunkTransport>, settings)
}

// ---------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------

#[tokio::test]
async fn test_upload_25mb_in_three_chunks() {
    let source = create_source_file(25 * MB);
    let transport = Arc::new(MockTransport::default());
    let coordinator = coordinator(&transport, settings(10 * MB, 2));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(
        report.outcome.urls(),
        vec![
            "https://files.example/u/movie.mp4.part000",
            "https://files.example/u/movie.mp4.part001",
            "https://files.example/u/movie.mp4.part002",
        ]
    );
    assert_eq!(report.file_size, 25 * MB);
    assert_eq!(report.chunk_count, 3);
    assert_eq!(report.bytes_transferred, 25 * MB);
    assert!(!report.session_id.is_empty());

    // Every chunk carried exactly its byte range.
    let expected = std::fs::read(source.path()).unwrap();
    let received = transport.received.lock().unwrap();
    for index in 0..3usize {
        let start = index * (10 * MB) as usize;
        let end = (start + (10 * MB) as usize).min(expected.len());
        assert_eq!(&received[&index][..], &expected[start..end], "chunk {} content", index);
    }
    assert_eq!(*transport.chunk_totals.lock().unwrap(), HashSet::from([3]));
}

#[tokio::test]
async fn test_upload_defaults_original_name_to_file_name() {
    let source = create_source_file(10);
    let transport = Arc::new(MockTransport::default());
    let coordinator = coordinator(&transport, settings(4, 2));

    let meta = TransferMetadata::new("http://unused.invalid/api/upload", "token");
    coordinator.upload(source.path(), meta).await.unwrap();

    let expected = source.path().file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(*transport.names.lock().unwrap(), HashSet::from([expected]));
}

#[tokio::test]
async fn test_upload_zero_byte_file_sends_one_empty_chunk() {
    let source = create_source_file(0);
    let transport = Arc::new(MockTransport::default());
    let coordinator = coordinator(&transport, settings(10 * MB, 8));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(report.chunk_count, 1);
    assert_eq!(report.outcome.urls().len(), 1);
    assert_eq!(report.bytes_transferred, 0);
    assert_eq!(transport.received.lock().unwrap()[&0].len(), 0);
}

// ---------------------------------------------------------------
// Failures
// ---------------------------------------------------------------

#[tokio::test]
async fn test_middle_chunk_failure_is_partial() {
    let source = create_source_file(25 * MB);
    let transport = Arc::new(MockTransport::failing(&[1]));
    let coordinator = coordinator(&transport, settings(10 * MB, 3));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    match &report.outcome {
        TransferOutcome::PartiallyFailed { succeeded, failed } => {
            let ok: Vec<usize> = succeeded.iter().map(|c| c.index).collect();
            assert_eq!(ok, vec![0, 2]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].index, 1);
            assert_eq!(failed[0].error, ChunkError::NetworkError("connection reset".to_string()));
        }
        other => panic!("expected PartiallyFailed, got {:?}", other),
    }
    assert_eq!(report.outcome.failed_indices(), vec![1]);
    // Retries are off: one attempt per chunk.
    assert_eq!(transport.total_attempts(), 3);
}

#[tokio::test]
async fn test_failures_do_not_cancel_other_chunks() {
    let source = create_source_file(50);
    let transport = Arc::new(MockTransport::failing(&[1, 3]));
    let coordinator = coordinator(&transport, settings(10, 2));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    assert!(!report.outcome.is_success());
    assert_eq!(report.outcome.failed_indices(), vec![1, 3]);
    let ok: Vec<usize> = report.outcome.succeeded().iter().map(|c| c.index).collect();
    assert_eq!(ok, vec![0, 2, 4]);
    for index in 0..5 {
        assert_eq!(transport.attempts_for(index), 1, "chunk {} attempted once", index);
    }
}

#[tokio::test]
async fn test_failed_chunk_bytes_still_count_as_transferred() {
    let source = create_source_file(40);
    let transport = Arc::new(MockTransport::failing(&[0]));
    let coordinator = coordinator(&transport, settings(20, 2));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    // Chunk 1 in full, plus the half of chunk 0 that went out before the reset.
    assert_eq!(report.bytes_transferred, 20 + 10);
}

// ---------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------

#[tokio::test]
async fn test_missing_source_is_source_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.mp4");
    let transport = Arc::new(MockTransport::default());
    let coordinator = coordinator(&transport, settings(10, 2));

    let err = coordinator.upload(&missing, metadata()).await.unwrap_err();
    match err {
        UploadError::SourceNotFound { path, .. } => assert_eq!(path, missing),
        other => panic!("expected SourceNotFound, got {:?}", other),
    }
    assert_eq!(transport.total_attempts(), 0);
}

#[tokio::test]
async fn test_directory_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::default());
    let coordinator = coordinator(&transport, settings(10, 2));

    let err = coordinator.upload(dir.path(), metadata()).await.unwrap_err();
    assert!(matches!(err, UploadError::SourceNotFound { .. }), "got {:?}", err);
    assert_eq!(transport.total_attempts(), 0);
}

#[tokio::test]
async fn test_zero_settings_are_invalid_configuration() {
    let source = create_source_file(10);
    let transport = Arc::new(MockTransport::default());

    for bad in [settings(0, 2), settings(10, 0)] {
        let err = coordinator(&transport, bad)
            .upload(source.path(), metadata())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidConfiguration(_)), "got {:?}", err);
    }
    assert_eq!(transport.total_attempts(), 0);
}

// ---------------------------------------------------------------
// Concurrency and ordering
// ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_never_exceeds_max_workers() {
    let source = create_source_file(200);
    let transport = Arc::new(MockTransport::default());
    let coordinator = coordinator(&transport, settings(10, 3));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(report.chunk_count, 20);
    let peak = transport.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {}", peak);
    assert!(peak >= 2, "expected uploads to overlap, peak was {}", peak);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_ordered_by_index_not_completion() {
    let source = create_source_file(40);
    let mut mock = MockTransport::default();
    // Chunk 0 finishes last.
    mock.delays.insert(0, Duration::from_millis(150));
    mock.delays.insert(1, Duration::from_millis(50));
    mock.delays.insert(2, Duration::from_millis(1));
    mock.delays.insert(3, Duration::from_millis(20));
    let transport = Arc::new(mock);
    let coordinator = coordinator(&transport, settings(10, 4));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    let indices: Vec<usize> = report.outcome.succeeded().iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_every_chunk_gets_exactly_one_result() {
    let source = create_source_file(1000);
    let transport = Arc::new(MockTransport::failing(&[7, 8, 50]));
    let coordinator = coordinator(&transport, settings(7, 5));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    let chunk_count = 1000usize.div_ceil(7);
    assert_eq!(report.chunk_count, chunk_count);
    let mut seen: Vec<usize> = report
        .outcome
        .succeeded()
        .iter()
        .map(|c| c.index)
        .chain(report.outcome.failed().iter().map(|c| c.index))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..chunk_count).collect::<Vec<_>>());
    assert_eq!(report.outcome.failed_indices(), vec![7, 8, 50]);
}

// ---------------------------------------------------------------
// Retry
// ---------------------------------------------------------------

#[tokio::test]
async fn test_retry_recovers_transient_failure() {
    let source = create_source_file(30);
    let mock = MockTransport::default();
    mock.flaky.lock().unwrap().insert(1, 2);
    let transport = Arc::new(mock);
    let coordinator = coordinator(
        &transport,
        TransferSettings {
            chunk_size: 10,
            max_workers: 2,
            max_retries: 2,
        },
    );

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(transport.attempts_for(1), 3);
    assert_eq!(transport.attempts_for(0), 1);
    // Half of chunk 1 was sent three times but only counts once.
    assert_eq!(report.bytes_transferred, 30);
}

#[tokio::test]
async fn test_retry_gives_up_after_max_retries() {
    let source = create_source_file(20);
    let transport = Arc::new(MockTransport::failing(&[0]));
    let coordinator = coordinator(
        &transport,
        TransferSettings {
            chunk_size: 10,
            max_workers: 2,
            max_retries: 1,
        },
    );

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    assert_eq!(report.outcome.failed_indices(), vec![0]);
    assert_eq!(transport.attempts_for(0), 2);
    assert_eq!(transport.attempts_for(1), 1);
}

// ---------------------------------------------------------------
// Progress subscription
// ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_subscription_reports_each_chunk() {
    let source = create_source_file(100);
    let transport = Arc::new(MockTransport::failing(&[4]));
    let coordinator = coordinator(&transport, settings(10, 4));

    let (tx, mut rx) = mpsc::channel(1024);
    coordinator.set_progress_tx(tx);

    let drain = tokio::spawn(async move {
        let mut totals = Vec::new();
        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                ProgressMessage::Progress(ev) => totals.push(ev.total_uploaded),
                ProgressMessage::ChunkUploaded { event, .. } => {
                    totals.push(event.total_uploaded);
                    uploaded.push(event.chunk_index);
                }
                ProgressMessage::ChunkFailed { event, .. } => {
                    totals.push(event.total_uploaded);
                    failed.push(event.chunk_index);
                }
            }
        }
        (totals, uploaded, failed)
    });

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();
    coordinator.clear_progress_tx();
    let (totals, mut uploaded, failed) = drain.await.unwrap();

    // Byte events from different workers may interleave; the running total
    // itself never exceeds the file and ends on the final count.
    assert!(totals.iter().all(|&t| t <= 100));
    assert_eq!(totals.iter().max().copied(), Some(report.bytes_transferred));
    assert_eq!(totals.last().copied(), Some(report.bytes_transferred));

    uploaded.sort_unstable();
    assert_eq!(uploaded, vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
    assert_eq!(failed, vec![4]);
}

// ---------------------------------------------------------------
// Lost workers and unreadable sources
// ---------------------------------------------------------------

/// Panics while sending chunk `panic_on`; succeeds for everything else.
struct PanickingTransport {
    panic_on: usize,
}

#[async_trait]
impl ChunkTransport for PanickingTransport {
    async fn send(
        &self,
        chunk: &ChunkDescriptor,
        bytes: Bytes,
        _metadata: &TransferMetadata,
        progress: ChunkProgress,
    ) -> ChunkResult {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if chunk.index == self.panic_on {
            panic!("transport blew up on chunk {}", chunk.index);
        }
        progress.advance(bytes.len() as u64);
        ChunkResult::success(chunk, format!("https://files.example/u/{}", chunk.index))
    }
}

#[tokio::test]
async fn test_panicking_worker_yields_worker_lost_for_its_chunk() {
    let source = create_source_file(50);
    let transport: Arc<dyn ChunkTransport> = Arc::new(PanickingTransport { panic_on: 1 });
    let coordinator = TransferCoordinator::new(transport, settings(10, 2));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    match &report.outcome {
        TransferOutcome::PartiallyFailed { succeeded, failed } => {
            assert_eq!(succeeded.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 2, 3, 4]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].index, 1);
            assert_eq!(failed[0].error, ChunkError::WorkerLost);
        }
        other => panic!("expected PartiallyFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sole_worker_lost_still_gives_every_chunk_a_result() {
    let source = create_source_file(30);
    let transport: Arc<dyn ChunkTransport> = Arc::new(PanickingTransport { panic_on: 0 });
    let coordinator = TransferCoordinator::new(transport, settings(10, 1));

    let report = tokio::time::timeout(Duration::from_secs(10), coordinator.upload(source.path(), metadata()))
        .await
        .expect("upload must not hang when its only worker dies")
        .unwrap();

    assert_eq!(report.chunk_count, 3);
    assert!(report.outcome.succeeded().is_empty());
    assert_eq!(report.outcome.failed_indices(), vec![0, 1, 2]);
    assert!(report
        .outcome
        .failed()
        .iter()
        .all(|c| c.error == ChunkError::WorkerLost));
}

/// Truncates the source file while sending chunk 0, so later reads run short.
struct TruncatingTransport {
    path: std::path::PathBuf,
    keep: u64,
}

#[async_trait]
impl ChunkTransport for TruncatingTransport {
    async fn send(
        &self,
        chunk: &ChunkDescriptor,
        bytes: Bytes,
        _metadata: &TransferMetadata,
        progress: ChunkProgress,
    ) -> ChunkResult {
        if chunk.index == 0 {
            let file = std::fs::OpenOptions::new().write(true).open(&self.path).unwrap();
            file.set_len(self.keep).unwrap();
        }
        progress.advance(bytes.len() as u64);
        ChunkResult::success(chunk, format!("https://files.example/u/{}", chunk.index))
    }
}

#[tokio::test]
async fn test_source_shrinking_mid_upload_is_source_read_error() {
    let source = create_source_file(30);
    let transport: Arc<dyn ChunkTransport> = Arc::new(TruncatingTransport {
        path: source.path().to_path_buf(),
        keep: 5,
    });
    // One worker so chunk 0 is sent before the others are read.
    let coordinator = TransferCoordinator::new(transport, settings(10, 1));

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();

    assert_eq!(report.outcome.urls(), vec!["https://files.example/u/0"]);
    assert_eq!(report.outcome.failed_indices(), vec![1, 2]);
    for failed in report.outcome.failed() {
        assert!(
            matches!(failed.error, ChunkError::SourceRead(_)),
            "chunk {}: {:?}",
            failed.index,
            failed.error
        );
    }
    // Nothing of the unreadable chunks was sent.
    assert_eq!(report.bytes_transferred, 10);
}

// ---------------------------------------------------------------
// Live snapshot
// ---------------------------------------------------------------

/// Sends each chunk in small delayed steps and publishes the session's
/// aggregator so a test can watch it.
struct SlowTransport {
    aggregator: Arc<std::sync::OnceLock<Arc<pasta_core::progress::ProgressAggregator>>>,
}

#[async_trait]
impl ChunkTransport for SlowTransport {
    async fn send(
        &self,
        chunk: &ChunkDescriptor,
        bytes: Bytes,
        _metadata: &TransferMetadata,
        progress: ChunkProgress,
    ) -> ChunkResult {
        let _ = self.aggregator.set(Arc::clone(progress.aggregator()));
        let step = (bytes.len() as u64 / 4).max(1);
        let mut sent = 0;
        while sent < bytes.len() as u64 {
            tokio::time::sleep(Duration::from_millis(3)).await;
            let n = step.min(bytes.len() as u64 - sent);
            progress.advance(n);
            sent += n;
        }
        ChunkResult::success(chunk, format!("https://files.example/u/{}", chunk.index))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_never_decreases_during_upload() {
    let source = create_source_file(400);
    let cell = Arc::new(std::sync::OnceLock::new());
    let transport: Arc<dyn ChunkTransport> = Arc::new(SlowTransport {
        aggregator: Arc::clone(&cell),
    });
    let coordinator = TransferCoordinator::new(transport, settings(40, 3));

    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let sampler = {
        let cell = Arc::clone(&cell);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut samples = Vec::new();
            while !done.load(Ordering::SeqCst) {
                if let Some(aggregator) = cell.get() {
                    samples.push(aggregator.snapshot());
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            samples
        })
    };

    let report = coordinator.upload(source.path(), metadata()).await.unwrap();
    done.store(true, Ordering::SeqCst);
    let samples = sampler.await.unwrap();

    assert!(report.outcome.is_success());
    assert!(samples.len() > 2, "expected samples while uploading, got {:?}", samples);
    assert!(samples.windows(2).all(|w| w[0] <= w[1]), "snapshot went backwards: {:?}", samples);
    assert!(samples.iter().all(|&s| s <= 400));
    assert_eq!(cell.get().map(|a| a.snapshot()), Some(report.bytes_transferred));
    assert_eq!(report.bytes_transferred, 400);
}
