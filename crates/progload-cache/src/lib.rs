//! # Progload Cache
//!
//! Worker side of the progressive loader: intercepts resource requests and
//! answers them from versioned, two-tier cache namespaces.
//!
//! ## Features
//!
//! - **Caching policies**: cache-first, network-first with a bounded network
//!   leg, and stale-while-revalidate, chosen per namespace
//! - **Request coalescing**: concurrent requests for one key share a single
//!   network fetch and a single cache write
//! - **Two tiers**: byte-budgeted LRU memory tier over an optional persisted
//!   tier with quota handling
//! - **HTTP freshness**: `Cache-Control` and `Expires` override namespace TTLs
//! - **Lifecycle**: install (precache), activate (purge stale versions),
//!   fetch, all driven through a message-passing actor

pub mod clock;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod fetcher;
pub mod freshness;
pub mod inflight;
pub mod metrics;
pub mod namespace;
pub mod routes;
pub mod storage;
pub mod tiered;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FallbackConfig, PrecacheConfig, RouteRule, WorkerConfig};
pub use engine::CacheStrategyEngine;
pub use entry::{CacheEntry, Tier};
pub use error::CacheError;
pub use fetcher::{FetchError, HttpFetcher, NetworkFetcher, NetworkResponse};
pub use freshness::{freshness_from_headers, Freshness};
pub use inflight::{InFlightMap, SharedFetch};
pub use metrics::{CacheMetrics, CacheStats};
pub use namespace::{CacheNamespaceStore, CachePolicy, NamespaceHandle, NamespaceSpec};
pub use routes::RouteTable;
pub use storage::{CacheStorage, DiskStorage, MemoryStorage, StoredEntryMeta};
pub use tiered::{BudgetCounter, Lookup, SetOutcome, TieredCache};
pub use worker::{InstallReport, Worker, WorkerHandle, WorkerState, WorkerStats};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, CacheError>;
