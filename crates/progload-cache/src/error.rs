//! Cache-related error types

use progload_domain::{DomainError, ErrorKind};
use thiserror::Error;

/// Cache operation errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Entry of {size} bytes exceeds namespace budget of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },

    #[error("Unknown cache namespace: {name}")]
    UnknownNamespace { name: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Lifecycle error: {message}")]
    Lifecycle { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid request: {0}")]
    Request(#[from] DomainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker is not running")]
    WorkerGone,
}

impl CacheError {
    /// Taxonomy bucket used when reporting to the performance bridge.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            CacheError::Deserialization { .. } => ErrorKind::Decode,
            _ => ErrorKind::Network,
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, CacheError::QuotaExceeded { .. })
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::Config {
            message: err.to_string(),
        }
    }
}
