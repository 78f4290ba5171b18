//! Error types for the response cache

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResponseCacheError {
    #[error("Cache error: {0}")]
    Cache(#[from] disk_lru_cache::CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tracing_subscriber::filter::ParseError> for ResponseCacheError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ResponseCacheError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ResponseCacheError>;
