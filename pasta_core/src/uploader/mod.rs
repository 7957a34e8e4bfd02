pub mod chunk_planner;
pub mod http_uploader;
pub mod transfer_coordinator;
pub mod transport;
