use serde::Serialize;

use crate::types::types::ChunkState;

/// Per-chunk progress snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSnapshot {
    pub index: usize,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub eta_secs: f64,
    pub state: ChunkState,
}

/// Aggregate progress snapshot for an entire upload.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub chunks: Vec<ChunkSnapshot>,
    pub total_bytes_uploaded: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub eta_secs: f64,
    pub failed_chunks: usize,
    pub done: bool,
}

impl ProgressSnapshot {
    pub fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            total_bytes_uploaded: 0,
            total_bytes: 0,
            speed: 0.0,
            eta_secs: 0.0,
            failed_chunks: 0,
            done: false,
        }
    }
}

/// `1536` -> `"1.5 KB"`.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}
