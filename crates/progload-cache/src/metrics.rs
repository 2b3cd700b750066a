//! Cache performance monitoring and metrics

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache performance statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Fresh hits in the memory tier
    pub memory_hits: u64,
    /// Fresh hits served from the persisted tier (and promoted)
    pub persisted_hits: u64,
    /// Expired entries served on purpose (stale-while-revalidate, network fallback)
    pub stale_hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries deleted because their TTL ran out
    pub expirations: u64,
    /// Entries evicted to stay within the byte budget
    pub evictions: u64,
    /// Successful stores
    pub stores: u64,
    /// Writes downgraded to memory-only after a quota failure
    pub quota_downgrades: u64,
    /// Underlying network fetches issued
    pub network_fetches: u64,
    /// Requests that joined an existing in-flight fetch
    pub coalesced_requests: u64,
    /// Responses answered with a fallback asset or offline marker
    pub fallbacks: u64,
    /// Timestamp of metrics creation
    pub created_at: DateTime<Utc>,
}

impl CacheStats {
    /// Total fresh hits across tiers
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.persisted_hits
    }

    /// Calculate hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits() as f64 / total as f64) * 100.0
        }
    }

    /// Share of requests that rode on someone else's fetch (0.0 to 100.0)
    pub fn coalescing_rate(&self) -> f64 {
        let total = self.network_fetches + self.coalesced_requests;
        if total == 0 {
            0.0
        } else {
            (self.coalesced_requests as f64 / total as f64) * 100.0
        }
    }
}

/// Thread-safe cache metrics tracker
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    memory_hits: Arc<AtomicU64>,
    persisted_hits: Arc<AtomicU64>,
    stale_hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    expirations: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    stores: Arc<AtomicU64>,
    quota_downgrades: Arc<AtomicU64>,
    network_fetches: Arc<AtomicU64>,
    coalesced_requests: Arc<AtomicU64>,
    fallbacks: Arc<AtomicU64>,
    created_at: DateTime<Utc>,
}

impl CacheMetrics {
    /// Create new cache metrics
    pub fn new() -> Self {
        Self {
            memory_hits: Arc::new(AtomicU64::new(0)),
            persisted_hits: Arc::new(AtomicU64::new(0)),
            stale_hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            expirations: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            stores: Arc::new(AtomicU64::new(0)),
            quota_downgrades: Arc::new(AtomicU64::new(0)),
            network_fetches: Arc::new(AtomicU64::new(0)),
            coalesced_requests: Arc::new(AtomicU64::new(0)),
            fallbacks: Arc::new(AtomicU64::new(0)),
            created_at: Utc::now(),
        }
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted_hit(&self) {
        self.persisted_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_downgrade(&self) {
        self.quota_downgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            persisted_hits: self.persisted_hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            quota_downgrades: self.quota_downgrades.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            created_at: self.created_at,
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
