use crate::types::types::{ChunkDescriptor, UploadError};

/// Default chunk size (10 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Splits a file of `file_size` bytes into contiguous, non-overlapping chunks
/// of at most `chunk_size` bytes, indexed densely from zero.
///
/// An empty file still yields one zero-length chunk so that every upload has
/// at least one unit of work to report completion for.
pub fn plan(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkDescriptor>, UploadError> {
    if chunk_size == 0 {
        return Err(UploadError::InvalidConfiguration(
            "chunk size must be greater than zero".to_string(),
        ));
    }

    if file_size == 0 {
        return Ok(vec![ChunkDescriptor::new(0, 0, 0)]);
    }

    let count = file_size.div_ceil(chunk_size);
    let chunks = (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            let length = chunk_size.min(file_size - offset);
            ChunkDescriptor::new(i as usize, offset, length)
        })
        .collect();

    Ok(chunks)
}
