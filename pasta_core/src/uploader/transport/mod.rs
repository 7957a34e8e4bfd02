pub mod chunk_transport;
pub mod http_chunk_transport;
