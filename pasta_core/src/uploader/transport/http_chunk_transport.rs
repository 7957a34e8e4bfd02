use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use tokio_util::io::ReaderStream;

use super::chunk_transport::ChunkTransport;
use crate::progress::aggregator::ChunkProgress;
use crate::types::types::{
    ChunkDescriptor, ChunkError, ChunkResult, TransferMetadata, UploadError, UploadResponse,
};

/// Size of the slices the request body is streamed in. Progress is reported
/// once per slice as the HTTP client pulls it.
const PROGRESS_SLICE: usize = 64 * 1024;

/// Multipart form field the remote expects the file under.
const FILE_FIELD: &str = "file";

/// Uploads chunks as `multipart/form-data` POSTs to a Zipline-style endpoint.
pub struct HttpChunkTransport {
    client: Client,
}

impl HttpChunkTransport {
    /// Builds a transport with a client tuned for `max_workers` parallel
    /// connections to the same host.
    pub fn new(max_workers: usize) -> Result<Self, UploadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(max_workers) // match concurrency
            .tcp_nodelay(true)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Applies the Zipline headers for one chunk to a request builder.
fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    chunk: &ChunkDescriptor,
    metadata: &TransferMetadata,
) -> reqwest::RequestBuilder {
    builder = builder
        .header("Authorization", &metadata.authorization)
        .header("x-zipline-format", "gfycat")
        .header(
            "x-zipline-original-name",
            metadata.original_name.as_deref().unwrap_or("true"),
        )
        .header("x-zipline-chunk-id", chunk.index.to_string())
        .header("x-zipline-chunk-total", metadata.chunk_total.to_string());

    if let Some(max_views) = metadata.max_views {
        builder = builder.header("x-zipline-max-views", max_views.to_string());
    }
    if let Some(password) = &metadata.password {
        builder = builder.header("x-zipline-password", password);
    }
    if let Some(folder) = &metadata.folder {
        builder = builder.header("x-zipline-folder", folder);
    }
    if let Some(deletes_at) = &metadata.deletes_at {
        builder = builder.header("x-zipline-deletes-at", deletes_at);
    }
    builder
}

/// `<original>.part<NNN>` with at least three digits.
pub fn part_file_name(original_name: &str, index: usize) -> String {
    format!("{}.part{:03}", original_name, index)
}

/// Media type for the part, based on the original file's extension.
pub fn media_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "mpg" | "mpeg" => "video/mpeg",
        "3gp" => "video/3gpp",
        _ => "application/octet-stream",
    }
}

/// Extracts the first file URL from a success body.
pub fn parse_upload_response(body: &[u8]) -> Result<String, ChunkError> {
    let response: UploadResponse = serde_json::from_slice(body)
        .map_err(|e| ChunkError::ProtocolError(format!("invalid response body: {}", e)))?;

    response
        .files
        .into_iter()
        .next()
        .map(|f| f.url)
        .ok_or_else(|| ChunkError::ProtocolError("response contains no files".to_string()))
}

#[async_trait]
impl ChunkTransport for HttpChunkTransport {
    async fn send(
        &self,
        chunk: &ChunkDescriptor,
        bytes: Bytes,
        metadata: &TransferMetadata,
        progress: ChunkProgress,
    ) -> ChunkResult {
        let original_name = metadata.original_name.as_deref().unwrap_or("upload");
        let part_name = part_file_name(original_name, chunk.index);
        let length = bytes.len() as u64;

        // Report bytes as the client pulls each slice off the body stream.
        let reporter = progress.clone();
        let stream = ReaderStream::with_capacity(Cursor::new(bytes), PROGRESS_SLICE)
            .inspect_ok(move |slice| reporter.advance(slice.len() as u64));

        let part = match Part::stream_with_length(Body::wrap_stream(stream), length)
            .file_name(part_name.clone())
            .mime_str(media_type_for(original_name))
        {
            Ok(part) => part,
            Err(e) => {
                return ChunkResult::failure(chunk, ChunkError::ProtocolError(e.to_string()), 0);
            }
        };
        let form = Form::new().part(FILE_FIELD, part);

        let builder = apply_headers(self.client.post(&metadata.endpoint), chunk, metadata);

        log::debug!(
            "[http_chunk_transport] chunk={}: POST {} as {} ({} bytes)",
            chunk.index, metadata.endpoint, part_name, length
        );

        let response = match builder.multipart(form).send().await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("[http_chunk_transport] chunk={}: request failed: {}", chunk.index, e);
                // A builder error means a header value could not be encoded.
                let error = if e.is_builder() {
                    ChunkError::ProtocolError(e.to_string())
                } else {
                    ChunkError::NetworkError(e.to_string())
                };
                return ChunkResult::failure(chunk, error, progress.position());
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => format!("<unreadable body: {}>", e),
            };
            log::warn!(
                "[http_chunk_transport] chunk={}: remote responded {}: {}",
                chunk.index, status, body
            );
            return ChunkResult::failure(
                chunk,
                ChunkError::RemoteRejected {
                    status: status.as_u16(),
                    body,
                },
                progress.position(),
            );
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return ChunkResult::failure(
                    chunk,
                    ChunkError::NetworkError(format!("failed to read response body: {}", e)),
                    progress.position(),
                );
            }
        };

        match parse_upload_response(&body) {
            Ok(url) => {
                // The body has been fully consumed by now; credit any tail the
                // stream did not report (e.g. an empty chunk).
                progress.advance(length.saturating_sub(progress.position()));
                log::debug!("[http_chunk_transport] chunk={}: uploaded -> {}", chunk.index, url);
                ChunkResult::success(chunk, url)
            }
            Err(e) => {
                log::warn!("[http_chunk_transport] chunk={}: {}", chunk.index, e);
                ChunkResult::failure(chunk, e, progress.position())
            }
        }
    }
}
