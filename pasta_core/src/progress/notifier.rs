use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::mpsc;

use super::observer::ProgressObserver;
use super::snapshot::{ChunkSnapshot, ProgressSnapshot};
use crate::types::types::{ChunkState, ProgressEvent, ProgressMessage};

/// Weight of the newest sample in the per-chunk speed average.
const EMA_ALPHA: f64 = 0.3;

/// Internal per-chunk tracking (purely data, no UI).
struct ChunkTracking {
    bytes_uploaded: u64,
    total_bytes: u64,
    speed: f64,
    last_update: Instant,
    state: ChunkState,
}

/// Consumes `ProgressMessage`s from the upload channel, aggregates them into
/// `ProgressSnapshot`s, and fans out to all registered observers.
///
/// # Lifecycle
///
/// | Channel message          | Observer method called              |
/// |--------------------------|-------------------------------------|
/// | `Progress(event)`        | `on_progress(&snapshot)`            |
/// | `ChunkUploaded { .. }`   | `on_chunk_uploaded` + `on_progress` |
/// | `ChunkFailed { .. }`     | `on_chunk_failed` + `on_progress`   |
/// | Channel closed           | `on_complete(&final_snapshot)`      |
///
/// Events may arrive out of order between workers; per-chunk and aggregate
/// byte counts only ever move forward.
pub struct ProgressNotifier {
    observers: Vec<Box<dyn ProgressObserver>>,
    chunks: BTreeMap<usize, ChunkTracking>,
    total_uploaded: u64,
    total_bytes: u64,
    start_time: Instant,
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            chunks: BTreeMap::new(),
            total_uploaded: 0,
            total_bytes: 0,
            start_time: Instant::now(),
        }
    }

    /// Observers added after `run()` starts are never called.
    pub fn add_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Consume progress messages until every sender has been dropped.
    pub async fn run(mut self, mut progress_rx: mpsc::Receiver<ProgressMessage>) {
        self.start_time = Instant::now();

        while let Some(msg) = progress_rx.recv().await {
            match msg {
                ProgressMessage::Progress(ev) => {
                    let snapshot = self.handle_event(ev, None);
                    for observer in &self.observers {
                        observer.on_progress(&snapshot).await;
                    }
                }
                ProgressMessage::ChunkUploaded { event, url } => {
                    let snapshot = self.handle_event(event, Some(ChunkState::Uploaded));
                    for observer in &self.observers {
                        observer.on_chunk_uploaded(event.chunk_index, &url).await;
                        observer.on_progress(&snapshot).await;
                    }
                }
                ProgressMessage::ChunkFailed { event, error } => {
                    let snapshot = self.handle_event(event, Some(ChunkState::Failed));
                    for observer in &self.observers {
                        observer.on_chunk_failed(event.chunk_index, &error).await;
                        observer.on_progress(&snapshot).await;
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Fold a single event into the tracking state and return the updated
    /// snapshot.
    fn handle_event(&mut self, ev: ProgressEvent, terminal: Option<ChunkState>) -> ProgressSnapshot {
        let now = Instant::now();

        self.total_uploaded = self.total_uploaded.max(ev.total_uploaded);
        self.total_bytes = self.total_bytes.max(ev.total_bytes);

        let chunk = self.chunks.entry(ev.chunk_index).or_insert_with(|| ChunkTracking {
            bytes_uploaded: 0,
            total_bytes: ev.chunk_length,
            speed: 0.0,
            last_update: now,
            state: ChunkState::Queued,
        });

        let delta = ev.chunk_uploaded.saturating_sub(chunk.bytes_uploaded);
        chunk.bytes_uploaded = chunk.bytes_uploaded.max(ev.chunk_uploaded);

        // Compute EMA speed
        let elapsed = now.duration_since(chunk.last_update).as_secs_f64();
        if elapsed > 0.0 {
            let instant_speed = delta as f64 / elapsed;
            chunk.speed = EMA_ALPHA * instant_speed + (1.0 - EMA_ALPHA) * chunk.speed;
            chunk.last_update = now;
        }

        match terminal {
            Some(state) => {
                chunk.state = state;
                chunk.speed = 0.0;
            }
            None if chunk.state == ChunkState::Queued => chunk.state = ChunkState::Uploading,
            None => {}
        }

        self.build_snapshot()
    }

    /// Current per-chunk and aggregate view.
    fn build_snapshot(&self) -> ProgressSnapshot {
        let combined_speed: f64 = self.chunks.values().map(|c| c.speed).sum();
        let remaining = self.total_bytes.saturating_sub(self.total_uploaded);
        let eta = if combined_speed > 0.0 {
            remaining as f64 / combined_speed
        } else {
            0.0
        };

        let chunk_snapshots: Vec<ChunkSnapshot> = self
            .chunks
            .iter()
            .map(|(&index, c)| {
                let rem = c.total_bytes.saturating_sub(c.bytes_uploaded);
                let chunk_eta = if c.speed > 0.0 { rem as f64 / c.speed } else { 0.0 };
                ChunkSnapshot {
                    index,
                    bytes_uploaded: c.bytes_uploaded,
                    total_bytes: c.total_bytes,
                    speed: c.speed,
                    eta_secs: chunk_eta,
                    state: c.state,
                }
            })
            .collect();

        ProgressSnapshot {
            chunks: chunk_snapshots,
            total_bytes_uploaded: self.total_uploaded,
            total_bytes: self.total_bytes,
            speed: combined_speed,
            eta_secs: eta,
            failed_chunks: self
                .chunks
                .values()
                .filter(|c| c.state == ChunkState::Failed)
                .count(),
            done: false,
        }
    }

    /// Sends the last snapshot, with the average speed over the whole run.
    async fn finish(self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let avg_speed = if elapsed > 0.0 {
            self.total_uploaded as f64 / elapsed
        } else {
            0.0
        };

        let mut final_snapshot = self.build_snapshot();
        final_snapshot.done = true;
        final_snapshot.speed = avg_speed;
        final_snapshot.eta_secs = 0.0;

        for observer in &self.observers {
            observer.on_complete(&final_snapshot).await;
        }
    }
}
