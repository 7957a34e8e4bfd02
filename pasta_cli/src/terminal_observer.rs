use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;

use pasta_core::progress::{format_bytes, ProgressObserver, ProgressSnapshot};

/// Renders upload progress as indicatif terminal bars.
///
/// One `ProgressBar` is created per chunk the first time it reports, plus a
/// total bar. All bars live under a shared `MultiProgress` so they render
/// cleanly.
pub struct TerminalProgressObserver {
    multi: MultiProgress,
    /// chunk index → ProgressBar (lazily initialised on first `on_progress` call)
    bars: Mutex<HashMap<usize, ProgressBar>>,
    total_bar: Mutex<Option<ProgressBar>>,
}

impl TerminalProgressObserver {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            total_bar: Mutex::new(None),
        }
    }

    fn chunk_style() -> ProgressStyle {
        ProgressStyle::with_template("Chunk {prefix:>4} [{bar:20.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-")
    }

    fn total_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "Total      [{bar:30.green/white}] {bytes}/{total_bytes} ({binary_bytes_per_sec}) ETA {eta}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
    }

    /// Ensure all per-chunk bars and the total bar exist for the given snapshot.
    fn ensure_bars(&self, snapshot: &ProgressSnapshot) {
        let (Ok(mut bars), Ok(mut total_bar)) = (self.bars.lock(), self.total_bar.lock()) else {
            return;
        };

        // Total bar first so chunk bars stack above it.
        if total_bar.is_none() && snapshot.total_bytes > 0 {
            let pb = self.multi.add(ProgressBar::new(snapshot.total_bytes));
            pb.set_style(Self::total_style());
            *total_bar = Some(pb);
        }

        for chunk in &snapshot.chunks {
            if !bars.contains_key(&chunk.index) {
                let bar = ProgressBar::new(chunk.total_bytes.max(1));
                let pb = match total_bar.as_ref() {
                    Some(total) => self.multi.insert_before(total, bar),
                    None => self.multi.add(bar),
                };
                pb.set_style(Self::chunk_style());
                pb.set_prefix(chunk.index.to_string());
                bars.insert(chunk.index, pb);
            }
        }
    }

    fn update_bars(&self, snapshot: &ProgressSnapshot) {
        let (Ok(bars), Ok(total_bar)) = (self.bars.lock(), self.total_bar.lock()) else {
            return;
        };

        for chunk in &snapshot.chunks {
            if let Some(pb) = bars.get(&chunk.index) {
                pb.set_length(chunk.total_bytes.max(1));
                pb.set_position(chunk.bytes_uploaded);
            }
        }

        if let Some(pb) = total_bar.as_ref() {
            pb.set_length(snapshot.total_bytes.max(1));
            pb.set_position(snapshot.total_bytes_uploaded);
        }
    }
}

#[async_trait]
impl ProgressObserver for TerminalProgressObserver {
    async fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.ensure_bars(snapshot);
        self.update_bars(snapshot);
    }

    async fn on_chunk_uploaded(&self, index: usize, _url: &str) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(pb) = bars.get(&index) {
                pb.finish_with_message("done");
            }
        }
    }

    async fn on_chunk_failed(&self, index: usize, error: &str) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(pb) = bars.get(&index) {
                pb.abandon_with_message(format!("failed: {}", error));
            }
        }
    }

    async fn on_complete(&self, snapshot: &ProgressSnapshot) {
        self.ensure_bars(snapshot);
        self.update_bars(snapshot);

        if let Ok(total_bar) = self.total_bar.lock() {
            if let Some(pb) = total_bar.as_ref() {
                if snapshot.failed_chunks > 0 {
                    pb.abandon();
                } else {
                    pb.finish();
                }
            }
        }

        let _ = self.multi.println(format!(
            "Sent {} at {}/s",
            format_bytes(snapshot.total_bytes_uploaded),
            format_bytes(snapshot.speed as u64)
        ));
    }
}
