//! Cache entries and the tier they live in

use progload_domain::{Payload, Response, ResponseSource};
use serde::{Deserialize, Serialize};

/// Storage tier holding an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Fast and volatile
    Memory,
    /// Slower, survives reload
    Persisted,
}

/// A cached response body plus the bookkeeping needed for expiry and budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Payload,
    pub content_type: String,
    pub status: u16,
    /// Epoch milliseconds of the write
    pub written_at: u64,
    pub ttl_ms: u64,
    pub tier: Tier,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        payload: Payload,
        content_type: impl Into<String>,
        ttl_ms: u64,
        written_at: u64,
    ) -> Self {
        let size_bytes = payload.size_bytes();
        Self {
            key: key.into(),
            payload,
            content_type: content_type.into(),
            status: 200,
            written_at,
            ttl_ms,
            tier: Tier::Memory,
            size_bytes,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// `now - written_at <= ttl_ms`. A clock that went backwards counts as fresh.
    pub fn is_fresh_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.written_at) <= self.ttl_ms
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        !self.is_fresh_at(now_ms)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.written_at)
    }

    pub fn to_response(&self, source: ResponseSource) -> Response {
        Response::new(
            self.status,
            self.content_type.clone(),
            self.payload.clone(),
            source,
        )
    }
}
