use thiserror::Error;

use crate::gateway::cache::CacheError;
use crate::gateway::config::ConfigError;
use crate::gateway::store::StoreError;
use crate::gateway::telemetry::DiskQueueError;

#[derive(Debug, Error)]
pub enum HeimdallError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("disk queue error: {0}")]
    DiskQueue(#[from] DiskQueueError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, HeimdallError>;
