use async_trait::async_trait;
use bytes::Bytes;

use crate::progress::aggregator::ChunkProgress;
use crate::types::types::{ChunkDescriptor, ChunkResult, TransferMetadata};

#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Sends one chunk and reports the outcome. Failures are returned inside
    /// the `ChunkResult`, never raised. Makes exactly one outbound request and
    /// reports bytes to `progress` as they are written.
    async fn send(
        &self,
        chunk: &ChunkDescriptor,
        bytes: Bytes,
        metadata: &TransferMetadata,
        progress: ChunkProgress,
    ) -> ChunkResult;
}
