//! Responses handed back across the loader boundary

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Body of a response or cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    /// Build a payload from a raw body, keeping JSON bodies structured.
    pub fn from_body(content_type: &str, body: Vec<u8>) -> Self {
        if content_type.contains("json") {
            if let Ok(value) = serde_json::from_slice(&body) {
                return Payload::Json(value);
            }
        }
        Payload::Bytes(body)
    }

    /// Size in bytes as counted against cache budgets.
    pub fn size_bytes(&self) -> u64 {
        match self {
            Payload::Bytes(bytes) => bytes.len() as u64,
            Payload::Json(value) => serde_json::to_vec(value)
                .map(|v| v.len() as u64)
                .unwrap_or(0),
        }
    }

    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Payload::Bytes(bytes) => Cow::Borrowed(bytes),
            Payload::Json(value) => Cow::Owned(serde_json::to_vec(value).unwrap_or_default()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    /// Fresh cache entry
    Cache,
    /// Expired cache entry served because the network was unusable or a
    /// background revalidation is pending
    StaleCache,
    /// Declared placeholder asset
    Fallback,
    /// Synthesized offline marker
    Offline,
    /// Uncontrolled request forwarded straight to the network
    Passthrough,
}

/// A resolved response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub payload: Payload,
    pub source: ResponseSource,
}

impl Response {
    pub fn new(
        status: u16,
        content_type: impl Into<String>,
        payload: Payload,
        source: ResponseSource,
    ) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            payload,
            source,
        }
    }

    /// Offline marker for JSON endpoints.
    pub fn offline_json(marker: serde_json::Value) -> Self {
        Self::new(
            503,
            "application/json",
            Payload::Json(marker),
            ResponseSource::Offline,
        )
    }

    /// Empty 503 for requests that have neither cache nor fallback.
    pub fn unavailable() -> Self {
        Self::new(
            503,
            "text/plain",
            Payload::Bytes(Vec::new()),
            ResponseSource::Offline,
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True when the response stands in for the real resource.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self.source,
            ResponseSource::Fallback | ResponseSource::Offline
        )
    }

    pub fn from_cache(&self) -> bool {
        matches!(
            self.source,
            ResponseSource::Cache | ResponseSource::StaleCache
        )
    }
}
