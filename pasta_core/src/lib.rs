pub mod config;
pub mod progress;
pub mod types;
pub mod uploader;
