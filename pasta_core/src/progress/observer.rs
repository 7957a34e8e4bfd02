use async_trait::async_trait;

use super::snapshot::ProgressSnapshot;

/// Trait for anything that wants to observe upload progress.
///
/// Lifecycle:
/// - `on_progress` is called for every aggregated progress update.
/// - `on_chunk_uploaded` / `on_chunk_failed` are called once per chunk as
///   its result arrives, in completion order (not index order).
/// - `on_complete` is called once after the last chunk has a result, whether
///   or not any chunk failed.
#[async_trait]
pub trait ProgressObserver: Send + Sync + 'static {
    /// Called with the latest aggregated snapshot after each progress event.
    async fn on_progress(&self, snapshot: &ProgressSnapshot);

    async fn on_chunk_uploaded(&self, _index: usize, _url: &str) {}

    /// Called when a chunk has failed. Other chunks keep going.
    async fn on_chunk_failed(&self, index: usize, error: &str);

    /// Called once with the final snapshot (`done == true`).
    async fn on_complete(&self, snapshot: &ProgressSnapshot);
}
