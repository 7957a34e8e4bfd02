use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors that abort an upload before any chunk work starts.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("source not found: {}: {source}", .path.display())]
    SourceNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Per-chunk failure. Recorded in the chunk's result, never propagated while
/// other chunks are still in flight.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ChunkError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("remote rejected chunk (HTTP {status}): {body}")]
    RemoteRejected { status: u16, body: String },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("could not read chunk from source: {0}")]
    SourceRead(String),

    #[error("worker terminated before reporting a result")]
    WorkerLost,
}

impl ChunkError {
    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChunkError::NetworkError(_) => true,
            ChunkError::RemoteRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Queued,
    Uploading,
    Uploaded,
    Failed,
}

/// A contiguous byte range of the source file, uploaded as one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

impl ChunkDescriptor {
    pub fn new(index: usize, offset: u64, length: u64) -> Self {
        Self { index, offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkOutcome {
    Success(String),
    Failure(ChunkError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub index: usize,
    pub outcome: ChunkOutcome,
    pub bytes_transferred: u64,
    pub attempts: u32,
}

impl ChunkResult {
    pub fn success(chunk: &ChunkDescriptor, url: String) -> Self {
        Self {
            index: chunk.index,
            outcome: ChunkOutcome::Success(url),
            bytes_transferred: chunk.length,
            attempts: 1,
        }
    }

    pub fn failure(chunk: &ChunkDescriptor, error: ChunkError, bytes_transferred: u64) -> Self {
        Self {
            index: chunk.index,
            outcome: ChunkOutcome::Failure(error),
            bytes_transferred,
            attempts: 1,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Success(_))
    }
}

/// Request decoration shared by every chunk of one upload.
///
/// `chunk_total` is filled in by the coordinator once the file is planned;
/// the chunk index itself comes from the `ChunkDescriptor`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub endpoint: String,
    pub authorization: String,
    pub original_name: Option<String>,
    pub max_views: Option<u32>,
    pub chunk_total: usize,
    pub password: Option<String>,
    pub folder: Option<String>,
    /// Opaque expiry token forwarded verbatim (e.g. `100y`).
    pub deletes_at: Option<String>,
}

impl TransferMetadata {
    pub fn new(endpoint: impl Into<String>, authorization: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            authorization: authorization.into(),
            ..Self::default()
        }
    }

    pub fn with_original_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = Some(name.into());
        self
    }

    /// `0` means unlimited and is stored as `None`.
    pub fn with_max_views(mut self, max_views: u32) -> Self {
        self.max_views = (max_views > 0).then_some(max_views);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_deletes_at(mut self, deletes_at: impl Into<String>) -> Self {
        self.deletes_at = Some(deletes_at.into());
        self
    }

    pub fn with_chunk_total(mut self, chunk_total: usize) -> Self {
        self.chunk_total = chunk_total;
        self
    }
}

/// One byte-level progress update. `total_uploaded` is the absolute aggregate,
/// so a dropped event never corrupts a subscriber's running view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub chunk_index: usize,
    pub chunk_uploaded: u64,
    pub chunk_length: u64,
    pub total_uploaded: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressMessage {
    Progress(ProgressEvent),
    ChunkUploaded { event: ProgressEvent, url: String },
    ChunkFailed { event: ProgressEvent, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedChunk {
    pub index: usize,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChunk {
    pub index: usize,
    pub error: ChunkError,
}

/// Final classification of a session. Any failure makes it `PartiallyFailed`,
/// even when every chunk failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferOutcome {
    AllSucceeded(Vec<UploadedChunk>),
    PartiallyFailed {
        succeeded: Vec<UploadedChunk>,
        failed: Vec<FailedChunk>,
    },
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::AllSucceeded(_))
    }

    pub fn succeeded(&self) -> &[UploadedChunk] {
        match self {
            TransferOutcome::AllSucceeded(chunks) => chunks,
            TransferOutcome::PartiallyFailed { succeeded, .. } => succeeded,
        }
    }

    pub fn failed(&self) -> &[FailedChunk] {
        match self {
            TransferOutcome::AllSucceeded(_) => &[],
            TransferOutcome::PartiallyFailed { failed, .. } => failed,
        }
    }

    /// URLs of the uploaded chunks, in chunk-index order.
    pub fn urls(&self) -> Vec<&str> {
        self.succeeded().iter().map(|c| c.url.as_str()).collect()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed().iter().map(|c| c.index).collect()
    }
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub session_id: String,
    pub outcome: TransferOutcome,
    pub file_size: u64,
    pub chunk_count: usize,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

/// Shape of the remote's success body: `{"files": [{"url": "..."}]}`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Deserialize)]
pub struct UploadedFile {
    pub url: String,
}
