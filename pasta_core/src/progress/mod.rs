pub mod aggregator;
pub mod notifier;
pub mod observer;
pub mod snapshot;

pub use aggregator::{ChunkProgress, ProgressAggregator};
pub use notifier::ProgressNotifier;
pub use observer::ProgressObserver;
pub use snapshot::{format_bytes, ChunkSnapshot, ProgressSnapshot};
