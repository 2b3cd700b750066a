//! Error taxonomy shared across the worker and page sides

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification every subsystem error maps into for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Fetch rejected or timed out
    Network,
    /// Persisted-store write over capacity
    QuotaExceeded,
    /// Image, font or bitmap decode failure
    Decode,
    /// Visibility-detection primitive absent
    UnsupportedFeature,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Decode => "decode",
            ErrorKind::UnsupportedFeature => "unsupported_feature",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while building domain values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),
}

/// Failure of a single load as seen from the page side.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// The worker answered, but only with a degraded or non-success response
    #[error("Resource unavailable (status {status})")]
    Unavailable { status: u16 },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Loader is no longer running")]
    LoaderGone,
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Decode { .. } => ErrorKind::Decode,
            _ => ErrorKind::Network,
        }
    }

    /// Decode failures are deterministic for a given byte stream, so retrying
    /// them is pointless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LoadError::Decode { .. } | LoadError::LoaderGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_classification() {
        let decode = LoadError::Decode {
            message: "bad header".to_string(),
        };
        assert_eq!(decode.kind(), ErrorKind::Decode);
        assert!(!decode.is_retryable());

        let timeout = LoadError::Timeout { after_ms: 3000 };
        assert_eq!(timeout.kind(), ErrorKind::Network);
        assert!(timeout.is_retryable());

        assert!(!LoadError::LoaderGone.is_retryable());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::QuotaExceeded).unwrap();
        assert_eq!(json, "\"quota_exceeded\"");
        assert_eq!(ErrorKind::UnsupportedFeature.to_string(), "unsupported_feature");
    }
}
