use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::types::types::{ChunkDescriptor, ProgressEvent, ProgressMessage};

/// Lock-free running total of bytes transferred across all chunks of one
/// session.
///
/// Workers report through per-attempt [`ChunkProgress`] handles. Each chunk
/// keeps a high-water mark clamped to its length, and only bytes beyond that
/// mark reach the total, so the total is monotonic and never exceeds the file
/// size even when a chunk is sent more than once.
///
/// When a sender is attached, every increment is forwarded as a
/// [`ProgressMessage::Progress`] with `try_send`; a full channel drops the
/// event instead of stalling the worker.
pub struct ProgressAggregator {
    transferred: AtomicU64,
    total_bytes: u64,
    lengths: Vec<u64>,
    marks: Vec<AtomicU64>,
    progress_tx: Option<mpsc::Sender<ProgressMessage>>,
}

impl ProgressAggregator {
    pub fn new(chunks: &[ChunkDescriptor]) -> Self {
        Self {
            transferred: AtomicU64::new(0),
            total_bytes: chunks.iter().map(|c| c.length).sum(),
            lengths: chunks.iter().map(|c| c.length).collect(),
            marks: chunks.iter().map(|_| AtomicU64::new(0)).collect(),
            progress_tx: None,
        }
    }

    pub fn with_sender(mut self, tx: Option<mpsc::Sender<ProgressMessage>>) -> Self {
        self.progress_tx = tx;
        self
    }

    /// Adds `bytes` to the running total. Unclamped; callers outside the
    /// crate go through [`report_chunk`](Self::report_chunk).
    pub(crate) fn report(&self, bytes: u64) -> u64 {
        self.transferred.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    /// Current total. Monotonically non-decreasing.
    pub fn snapshot(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes credited so far to chunk `index`.
    pub fn chunk_snapshot(&self, index: usize) -> u64 {
        self.marks
            .get(index)
            .map(|m| m.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Records that chunk `index` has reached `position` bytes in the current
    /// attempt. Positions at or below the chunk's high-water mark are ignored.
    pub fn report_chunk(&self, index: usize, position: u64) {
        let (Some(mark), Some(&length)) = (self.marks.get(index), self.lengths.get(index)) else {
            log::warn!("[progress_aggregator] report for unknown chunk {}", index);
            return;
        };

        let position = position.min(length);
        let previous = mark.fetch_max(position, Ordering::AcqRel);
        if position <= previous {
            return;
        }

        let total = self.report(position - previous);

        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(ProgressMessage::Progress(ProgressEvent {
                chunk_index: index,
                chunk_uploaded: position,
                chunk_length: length,
                total_uploaded: total,
                total_bytes: self.total_bytes,
            }));
        }
    }

    /// Builds an event describing the current state of chunk `index`.
    pub fn event_for(&self, index: usize) -> ProgressEvent {
        ProgressEvent {
            chunk_index: index,
            chunk_uploaded: self.chunk_snapshot(index),
            chunk_length: self.lengths.get(index).copied().unwrap_or(0),
            total_uploaded: self.snapshot(),
            total_bytes: self.total_bytes,
        }
    }

    /// Sends a chunk-completion message. Unlike byte-level events these are
    /// awaited, so subscribers always see every chunk finish.
    pub async fn notify(&self, message: ProgressMessage) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(message).await;
        }
    }
}

/// Progress handle for a single attempt at uploading one chunk.
///
/// Cheap to clone; clones share the same attempt position.
#[derive(Clone)]
pub struct ChunkProgress {
    index: usize,
    position: Arc<AtomicU64>,
    aggregator: Arc<ProgressAggregator>,
}

impl ChunkProgress {
    pub fn new(index: usize, aggregator: Arc<ProgressAggregator>) -> Self {
        Self {
            index,
            position: Arc::new(AtomicU64::new(0)),
            aggregator,
        }
    }

    /// A handle not attached to any session, for callers that don't track
    /// progress.
    pub fn detached(chunk: &ChunkDescriptor) -> Self {
        let aggregator = ProgressAggregator::new(&[ChunkDescriptor::new(0, 0, chunk.length)]);
        Self::new(0, Arc::new(aggregator))
    }

    /// Advances this attempt by `bytes` written.
    pub fn advance(&self, bytes: u64) {
        let position = self.position.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.aggregator.report_chunk(self.index, position);
    }

    /// Bytes written in this attempt.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// The session-wide counter this handle reports into.
    pub fn aggregator(&self) -> &Arc<ProgressAggregator> {
        &self.aggregator
    }
}
