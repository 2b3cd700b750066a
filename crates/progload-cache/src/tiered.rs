//! Two-tier cache with TTL expiry and byte-budgeted LRU eviction
//!
//! The memory tier is an [`LruCache`] whose order doubles as the recency
//! order of the whole namespace: least recently used first, ties broken by
//! insertion order. The optional persisted tier mirrors every write that fits
//! its quota.
//!
//! The byte budget covers both tiers. Entries that exist only in the persisted
//! tier, typically left by an earlier worker generation, are indexed on first
//! use, count against the budget, and are evicted before any memory entry,
//! oldest write first.
//!
//! All state mutations of `get`/`set` happen under one async mutex, so a
//! lookup never observes a half-applied insert or eviction even when the
//! caller re-enters from a nested future.

use std::collections::HashMap;
use std::sync::Arc;

use lru::LruCache;
use progload_domain::{ErrorKind, SignalReporter};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::entry::{CacheEntry, Tier};
use crate::metrics::CacheMetrics;
use crate::storage::CacheStorage;
use crate::{CacheError, Result};

/// Byte accounting for a namespace, across both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetCounter {
    pub current_bytes: u64,
    pub max_bytes: u64,
}

impl BudgetCounter {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            current_bytes: 0,
            max_bytes,
        }
    }

    pub fn fits(&self, size: u64) -> bool {
        self.current_bytes + size <= self.max_bytes
    }

    pub fn available(&self) -> u64 {
        self.max_bytes.saturating_sub(self.current_bytes)
    }
}

/// Result of a successful `set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    /// Keys evicted (from both tiers) to make room, oldest first
    pub evicted: Vec<String>,
    /// Tier the entry ended up in; `Memory` after a quota downgrade or when
    /// no persisted tier is configured
    pub tier: Tier,
}

/// A lookup that may return expired entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub entry: CacheEntry,
    pub fresh: bool,
}

/// Entry known only to the persisted tier
#[derive(Debug, Clone, Copy)]
struct ColdEntry {
    size_bytes: u64,
    written_at: u64,
}

struct TierState {
    memory: LruCache<String, CacheEntry>,
    cold: HashMap<String, ColdEntry>,
    budget: BudgetCounter,
    indexed: bool,
}

impl TierState {
    /// Stop tracking `key` in either tier. Returns whether it was tracked.
    fn forget(&mut self, key: &str) -> bool {
        if let Some(entry) = self.memory.pop(key) {
            self.budget.current_bytes -= entry.size_bytes;
            return true;
        }
        if let Some(cold) = self.cold.remove(key) {
            self.budget.current_bytes -= cold.size_bytes;
            return true;
        }
        false
    }

    /// Cold keys, oldest write first
    fn cold_order(&self) -> Vec<String> {
        let mut cold: Vec<(&String, &ColdEntry)> = self.cold.iter().collect();
        cold.sort_by(|a, b| a.1.written_at.cmp(&b.1.written_at).then(a.0.cmp(b.0)));
        cold.into_iter().map(|(key, _)| key.clone()).collect()
    }
}

/// Bounded two-tier cache.
pub struct TieredCache {
    name: String,
    state: Mutex<TierState>,
    persisted: Option<Arc<dyn CacheStorage>>,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
    reporter: SignalReporter,
}

impl TieredCache {
    /// Memory-only cache bounded by `max_bytes`
    pub fn new(name: impl Into<String>, max_bytes: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(TierState {
                memory: LruCache::unbounded(),
                cold: HashMap::new(),
                budget: BudgetCounter::new(max_bytes),
                indexed: false,
            }),
            persisted: None,
            clock,
            metrics: CacheMetrics::new(),
            reporter: SignalReporter::disconnected(),
        }
    }

    /// Add the persisted tier
    pub fn with_persisted(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.persisted = Some(storage);
        self
    }

    /// Share a metrics tracker
    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Report quota downgrades to the performance bridge
    pub fn with_reporter(mut self, reporter: SignalReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Snapshot of the byte budget
    pub async fn budget(&self) -> BudgetCounter {
        self.lock_state().await.budget
    }

    /// Memory-tier keys, least recently used first
    pub async fn recency_order(&self) -> Vec<String> {
        let state = self.lock_state().await;
        state.memory.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    /// Fresh entry for `key`. Expired entries are deleted from both tiers and
    /// reported as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state().await;

        if let Some(entry) = state.memory.get(key).cloned() {
            if entry.is_fresh_at(now) {
                self.metrics.record_memory_hit();
                debug!("Cache hit in memory tier of {}: {}", self.name, key);
                return Ok(Some(entry));
            }
            debug!("Cache expired in memory tier of {}: {}", self.name, key);
            self.drop_entry(&mut state, key).await;
            self.metrics.record_expiration();
            self.metrics.record_miss();
            return Ok(None);
        }

        let Some(entry) = self.read_persisted(key).await else {
            self.metrics.record_miss();
            return Ok(None);
        };

        if entry.is_expired_at(now) {
            debug!("Cache expired in persisted tier of {}: {}", self.name, key);
            self.drop_entry(&mut state, key).await;
            self.metrics.record_expiration();
            self.metrics.record_miss();
            return Ok(None);
        }

        self.metrics.record_persisted_hit();
        debug!("Cache hit in persisted tier of {}: {}", self.name, key);
        self.promote(&mut state, entry.clone()).await;
        Ok(Some(entry))
    }

    /// Entry for `key` regardless of TTL. Nothing is deleted; the caller
    /// decides whether a stale entry is acceptable.
    pub async fn get_allow_stale(&self, key: &str) -> Result<Option<Lookup>> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state().await;

        let entry = match state.memory.get(key).cloned() {
            Some(entry) => entry,
            None => match self.read_persisted(key).await {
                Some(entry) => {
                    self.promote(&mut state, entry.clone()).await;
                    entry
                }
                None => {
                    self.metrics.record_miss();
                    return Ok(None);
                }
            },
        };

        let fresh = entry.is_fresh_at(now);
        if fresh {
            self.metrics.record_memory_hit();
        } else {
            self.metrics.record_stale_hit();
        }
        Ok(Some(Lookup { entry, fresh }))
    }

    /// Insert or refresh an entry, evicting least recently used entries until
    /// it fits. After this returns `current_bytes <= max_bytes`, counting
    /// persisted-only entries too.
    pub async fn set(&self, mut entry: CacheEntry) -> Result<SetOutcome> {
        let size = entry.size_bytes;
        let mut state = self.lock_state().await;

        if size > state.budget.max_bytes {
            return Err(CacheError::EntryTooLarge {
                size,
                max: state.budget.max_bytes,
            });
        }

        let key = entry.key.clone();
        state.forget(&key);

        let evicted = self.evict_for(&mut state, size).await;

        let tier = match self.persisted {
            Some(_) => self.write_persisted(&mut state, &entry).await,
            None => Tier::Memory,
        };

        entry.tier = tier;
        state.budget.current_bytes += size;
        state.memory.push(key.clone(), entry);
        self.metrics.record_store();

        debug!(
            "Stored {} in {} ({} bytes, {}/{} used)",
            key, self.name, size, state.budget.current_bytes, state.budget.max_bytes
        );

        Ok(SetOutcome { evicted, tier })
    }

    /// Remove a key from both tiers
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.lock_state().await;
        let tracked = state.forget(key);

        let in_persisted = match self.persisted {
            Some(ref persisted) => persisted.remove(key).await?,
            None => false,
        };
        Ok(tracked || in_persisted)
    }

    /// Keys present in either tier, in eviction order: persisted-only keys
    /// by write time, then memory keys least recently used first
    pub async fn keys(&self) -> Result<Vec<String>> {
        let state = self.lock_state().await;
        let mut keys = state.cold_order();
        keys.extend(state.memory.iter().rev().map(|(k, _)| k.clone()));
        Ok(keys)
    }

    /// Drop everything in both tiers
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.lock_state().await;
        state.memory.clear();
        state.cold.clear();
        state.budget.current_bytes = 0;
        if let Some(ref persisted) = self.persisted {
            persisted.clear().await?;
        }
        debug!("Cleared cache {}", self.name);
        Ok(())
    }

    async fn read_persisted(&self, key: &str) -> Option<CacheEntry> {
        let persisted = self.persisted.as_ref()?;
        match persisted.get(key).await {
            Ok(Some(mut entry)) => {
                entry.tier = Tier::Persisted;
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                // Unreadable entries are misses, and get rewritten on the next store
                warn!("Persisted lookup failed in {} for {}: {}", self.name, key, e);
                None
            }
        }
    }

    async fn remove_persisted(&self, key: &str) {
        if let Some(ref persisted) = self.persisted {
            if let Err(e) = persisted.remove(key).await {
                warn!("Failed to remove {} from persisted tier of {}: {}", key, self.name, e);
            }
        }
    }

    async fn drop_entry(&self, state: &mut TierState, key: &str) {
        state.forget(key);
        self.remove_persisted(key).await;
    }

    /// Lock the state, indexing the persisted tier on first use.
    async fn lock_state(&self) -> MutexGuard<'_, TierState> {
        let mut state = self.state.lock().await;
        if !state.indexed {
            state.indexed = true;
            self.index_persisted(&mut state).await;
        }
        state
    }

    /// Account for entries already in the persisted tier, then trim to budget.
    async fn index_persisted(&self, state: &mut TierState) {
        let Some(ref persisted) = self.persisted else {
            return;
        };
        let index = match persisted.index().await {
            Ok(index) => index,
            Err(e) => {
                warn!("Could not index persisted tier of {}: {}", self.name, e);
                return;
            }
        };

        for meta in index {
            if state.memory.contains(&meta.key) {
                continue;
            }
            state.budget.current_bytes += meta.size_bytes;
            state.cold.insert(
                meta.key,
                ColdEntry {
                    size_bytes: meta.size_bytes,
                    written_at: meta.written_at,
                },
            );
        }

        let evicted = self.evict_for(state, 0).await;
        debug!(
            "Indexed {} persisted entries of {} ({}/{} used, {} evicted)",
            state.cold.len(),
            self.name,
            state.budget.current_bytes,
            state.budget.max_bytes,
            evicted.len()
        );
    }

    /// Evict until `size` more bytes fit: persisted-only entries first, then
    /// the least recently used memory entries.
    async fn evict_for(&self, state: &mut TierState, size: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut cold = state.cold_order().into_iter();
        while !state.budget.fits(size) {
            let (key, bytes) = match cold.next() {
                Some(key) => {
                    let bytes = state.cold.remove(&key).map_or(0, |c| c.size_bytes);
                    (key, bytes)
                }
                None => match state.memory.pop_lru() {
                    Some((key, entry)) => (key, entry.size_bytes),
                    None => break,
                },
            };
            state.budget.current_bytes -= bytes;
            self.remove_persisted(&key).await;
            debug!("Evicted {} from {} ({} bytes)", key, self.name, bytes);
            evicted.push(key);
        }
        if !evicted.is_empty() {
            self.metrics.record_evictions(evicted.len());
        }
        evicted
    }

    /// Bring a persisted entry into memory, making room if needed.
    async fn promote(&self, state: &mut TierState, entry: CacheEntry) {
        let size = entry.size_bytes;
        if size > state.budget.max_bytes {
            return;
        }
        if let Some(cold) = state.cold.remove(&entry.key) {
            state.budget.current_bytes -= cold.size_bytes;
        }
        let evicted = self.evict_for(state, size).await;
        if !evicted.is_empty() {
            debug!("Promotion of {} evicted {:?}", entry.key, evicted);
        }
        state.budget.current_bytes += size;
        state.memory.push(entry.key.clone(), entry);
    }

    /// Persist `entry`. A quota failure triggers one sweep and one retry; a
    /// second failure downgrades the key to memory-only.
    async fn write_persisted(&self, state: &mut TierState, entry: &CacheEntry) -> Tier {
        let Some(ref persisted) = self.persisted else {
            return Tier::Memory;
        };

        let first = match persisted.set(&entry.key, entry).await {
            Ok(()) => return Tier::Persisted,
            Err(e) => e,
        };

        let (requested, available) = match first {
            CacheError::QuotaExceeded {
                requested,
                available,
            } => (requested, available),
            other => {
                warn!(
                    "Persisted write failed in {} for {}: {}; keeping memory-only",
                    self.name, entry.key, other
                );
                self.remove_persisted(&entry.key).await;
                return Tier::Memory;
            }
        };

        debug!(
            "Quota exceeded in {} for {} ({} requested, {} available); sweeping",
            self.name, entry.key, requested, available
        );
        self.sweep_persisted(state, &entry.key, requested.saturating_sub(available))
            .await;

        match persisted.set(&entry.key, entry).await {
            Ok(()) => Tier::Persisted,
            Err(e) => {
                warn!(
                    "Persisted write failed again in {} for {}: {}; downgrading to memory-only",
                    self.name, entry.key, e
                );
                // An older copy must not outlive the downgrade
                self.remove_persisted(&entry.key).await;
                self.metrics.record_quota_downgrade();
                self.reporter
                    .report_error(ErrorKind::QuotaExceeded, entry.key.clone());
                Tier::Memory
            }
        }
    }

    /// Free at least `needed` bytes of the persisted tier: expired entries
    /// first, then oldest writes.
    async fn sweep_persisted(&self, state: &mut TierState, keep: &str, needed: u64) {
        let Some(ref persisted) = self.persisted else {
            return;
        };
        let index = match persisted.index().await {
            Ok(index) => index,
            Err(e) => {
                warn!("Could not index persisted tier of {}: {}", self.name, e);
                return;
            }
        };

        let now = self.clock.now_ms();
        let (mut expired, mut live): (Vec<_>, Vec<_>) = index
            .into_iter()
            .filter(|meta| meta.key != keep)
            .partition(|meta| now.saturating_sub(meta.written_at) > meta.ttl_ms);
        expired.sort_by(|a, b| a.written_at.cmp(&b.written_at).then(a.key.cmp(&b.key)));
        live.sort_by(|a, b| a.written_at.cmp(&b.written_at).then(a.key.cmp(&b.key)));

        let mut freed = 0u64;
        let mut swept = 0usize;
        let expired_count = expired.len();
        for (position, meta) in expired.into_iter().chain(live).enumerate() {
            if position >= expired_count && freed >= needed {
                break;
            }
            match persisted.remove(&meta.key).await {
                Ok(_) => {
                    freed += meta.stored_bytes;
                    swept += 1;
                    match state.memory.peek_mut(&meta.key) {
                        Some(entry) => entry.tier = Tier::Memory,
                        None => {
                            if let Some(cold) = state.cold.remove(&meta.key) {
                                state.budget.current_bytes -= cold.size_bytes;
                            }
                        }
                    }
                }
                Err(e) => warn!("Sweep could not remove {}: {}", meta.key, e),
            }
        }
        debug!("Swept {} entries ({} bytes) from {}", swept, freed, self.name);
    }
}

#[cfg(test)]
mod tests {
    use progload_domain::Payload;
    use proptest::prelude::*;

    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;

    fn entry(key: &str, size: usize, ttl_ms: u64, written_at: u64) -> CacheEntry {
        CacheEntry::new(key, Payload::Bytes(vec![0; size]), "image/jpeg", ttl_ms, written_at)
    }

    fn cache(max_bytes: u64) -> (TieredCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (TieredCache::new("test-v1", max_bytes, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_eviction_keeps_most_recent() {
        let (cache, _) = cache(25);
        cache.set(entry("A", 10, 60_000, 1_000)).await.unwrap();
        cache.set(entry("B", 10, 60_000, 1_000)).await.unwrap();
        let outcome = cache.set(entry("C", 10, 60_000, 1_000)).await.unwrap();

        assert_eq!(outcome.evicted, vec!["A".to_string()]);
        assert_eq!(cache.recency_order().await, vec!["B", "C"]);
        assert_eq!(cache.budget().await.current_bytes, 20);
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let (cache, _) = cache(25);
        cache.set(entry("A", 10, 60_000, 1_000)).await.unwrap();
        cache.set(entry("B", 10, 60_000, 1_000)).await.unwrap();
        assert!(cache.get("A").await.unwrap().is_some());
        cache.set(entry("C", 10, 60_000, 1_000)).await.unwrap();

        assert_eq!(cache.recency_order().await, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_expired_entry_is_deleted() {
        let (cache, clock) = cache(100);
        cache.set(entry("A", 10, 500, 1_000)).await.unwrap();
        clock.advance(500);
        assert!(cache.get("A").await.unwrap().is_some());
        clock.advance(1);
        assert!(cache.get("A").await.unwrap().is_none());
        assert_eq!(cache.budget().await.current_bytes, 0);
        assert_eq!(cache.metrics().snapshot().expirations, 1);
    }

    #[tokio::test]
    async fn test_stale_lookup_does_not_delete() {
        let (cache, clock) = cache(100);
        cache.set(entry("A", 10, 500, 1_000)).await.unwrap();
        clock.advance(10_000);

        let lookup = cache.get_allow_stale("A").await.unwrap().unwrap();
        assert!(!lookup.fresh);
        assert!(cache.get_allow_stale("A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_in_place_replaces_bytes() {
        let (cache, _) = cache(100);
        cache.set(entry("A", 10, 500, 1_000)).await.unwrap();
        cache.set(entry("A", 30, 500, 1_000)).await.unwrap();
        assert_eq!(cache.budget().await.current_bytes, 30);
        assert_eq!(cache.recency_order().await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let (cache, _) = cache(25);
        cache.set(entry("A", 10, 500, 1_000)).await.unwrap();
        let err = cache.set(entry("B", 26, 500, 1_000)).await.unwrap_err();
        assert!(matches!(err, CacheError::EntryTooLarge { size: 26, max: 25 }));
        assert_eq!(cache.recency_order().await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_persisted_hit_is_promoted() {
        let clock = Arc::new(ManualClock::new(1_000));
        let persisted = Arc::new(MemoryStorage::new());
        persisted.set("A", &entry("A", 10, 60_000, 1_000)).await.unwrap();

        let cache = TieredCache::new("static-v1", 100, clock).with_persisted(persisted);
        let hit = cache.get("A").await.unwrap().unwrap();
        assert_eq!(hit.tier, Tier::Persisted);
        assert_eq!(cache.recency_order().await, vec!["A"]);
        assert_eq!(cache.metrics().snapshot().persisted_hits, 1);
    }

    #[tokio::test]
    async fn test_expired_persisted_entry_is_deleted() {
        let clock = Arc::new(ManualClock::new(100_000));
        let persisted = Arc::new(MemoryStorage::new());
        persisted.set("A", &entry("A", 10, 50, 1_000)).await.unwrap();

        let cache = TieredCache::new("static-v1", 100, clock).with_persisted(persisted.clone());
        assert!(cache.get("A").await.unwrap().is_none());
        assert!(!persisted.contains("A").await.unwrap());
    }

    #[tokio::test]
    async fn test_eviction_removes_from_both_tiers() {
        let clock = Arc::new(ManualClock::new(1_000));
        let persisted = Arc::new(MemoryStorage::new());
        let cache = TieredCache::new("images-v1", 25, clock).with_persisted(persisted.clone());

        cache.set(entry("A", 10, 60_000, 1_000)).await.unwrap();
        cache.set(entry("B", 10, 60_000, 1_000)).await.unwrap();
        cache.set(entry("C", 10, 60_000, 1_000)).await.unwrap();

        assert!(!persisted.contains("A").await.unwrap());
        let mut keys = cache.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_quota_sweep_then_retry_succeeds() {
        let clock = Arc::new(ManualClock::new(10_000));
        let probe = entry("old", 100, 60_000, 1_000);
        let one = serde_json::to_vec(&probe).unwrap().len() as u64;
        let persisted = Arc::new(MemoryStorage::with_quota(one + one / 2));
        persisted.set("old", &probe).await.unwrap();

        let cache = TieredCache::new("images-v1", 10_000, clock).with_persisted(persisted.clone());
        let outcome = cache.set(entry("new", 100, 60_000, 10_000)).await.unwrap();

        assert_eq!(outcome.tier, Tier::Persisted);
        assert!(!persisted.contains("old").await.unwrap());
        assert!(persisted.contains("new").await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_second_failure_downgrades_to_memory() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (reporter, mut signals) = SignalReporter::channel();
        let persisted = Arc::new(MemoryStorage::with_quota(16));
        let cache = TieredCache::new("images-v1", 10_000, clock)
            .with_persisted(persisted.clone())
            .with_reporter(reporter);

        let outcome = cache.set(entry("big", 100, 60_000, 1_000)).await.unwrap();
        assert_eq!(outcome.tier, Tier::Memory);
        assert!(!persisted.contains("big").await.unwrap());

        let hit = cache.get("big").await.unwrap().unwrap();
        assert_eq!(hit.tier, Tier::Memory);
        assert_eq!(cache.metrics().snapshot().quota_downgrades, 1);
        assert_eq!(
            signals.recv().await.unwrap(),
            progload_domain::PerformanceSignal::Error {
                kind: ErrorKind::QuotaExceeded,
                key: "big".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_downgrade_drops_older_persisted_copy() {
        let clock = Arc::new(ManualClock::new(1_000));
        let small = entry("K", 10, 60_000, 1_000);
        let quota = serde_json::to_vec(&small).unwrap().len() as u64;
        let persisted = Arc::new(MemoryStorage::with_quota(quota));
        let cache = TieredCache::new("api-v1", 10_000, clock.clone())
            .with_persisted(persisted.clone());

        assert_eq!(cache.set(small).await.unwrap().tier, Tier::Persisted);
        let outcome = cache.set(entry("K", 200, 60_000, 1_000)).await.unwrap();
        assert_eq!(outcome.tier, Tier::Memory);
        assert!(!persisted.contains("K").await.unwrap());
        assert_eq!(cache.get("K").await.unwrap().unwrap().size_bytes, 200);

        let next = TieredCache::new("api-v1", 10_000, clock).with_persisted(persisted);
        assert!(next.get("K").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_budget_spans_generations() {
        let clock = Arc::new(ManualClock::new(1_000));
        let persisted = Arc::new(MemoryStorage::new());
        let first = TieredCache::new("images-v1", 25, clock.clone())
            .with_persisted(persisted.clone());
        first.set(entry("A", 10, 60_000, 1_000)).await.unwrap();
        first.set(entry("B", 10, 60_000, 1_001)).await.unwrap();
        drop(first);

        let second = TieredCache::new("images-v1", 25, clock).with_persisted(persisted.clone());
        assert_eq!(second.budget().await.current_bytes, 20);
        assert_eq!(second.keys().await.unwrap(), vec!["A", "B"]);

        let outcome = second.set(entry("C", 10, 60_000, 2_000)).await.unwrap();
        assert_eq!(outcome.evicted, vec!["A".to_string()]);
        let outcome = second.set(entry("D", 10, 60_000, 2_001)).await.unwrap();
        assert_eq!(outcome.evicted, vec!["B".to_string()]);

        assert_eq!(second.keys().await.unwrap(), vec!["C", "D"]);
        assert_eq!(second.budget().await.current_bytes, 20);
        assert_eq!(persisted.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_smaller_budget_trims_persisted_tier_on_open() {
        let clock = Arc::new(ManualClock::new(5_000));
        let persisted = Arc::new(MemoryStorage::new());
        for (key, written_at) in [("A", 1_000), ("B", 2_000), ("C", 3_000)] {
            persisted.set(key, &entry(key, 10, 60_000, written_at)).await.unwrap();
        }

        let cache = TieredCache::new("images-v2", 15, clock).with_persisted(persisted.clone());
        assert_eq!(cache.budget().await.current_bytes, 10);
        assert_eq!(cache.keys().await.unwrap(), vec!["C"]);
        assert!(!persisted.contains("A").await.unwrap());
        assert!(!persisted.contains("B").await.unwrap());
        assert_eq!(cache.metrics().snapshot().evictions, 2);
    }

    #[tokio::test]
    async fn test_promoted_entry_is_counted_once() {
        let clock = Arc::new(ManualClock::new(1_000));
        let persisted = Arc::new(MemoryStorage::new());
        persisted.set("A", &entry("A", 10, 60_000, 1_000)).await.unwrap();

        let cache = TieredCache::new("static-v1", 100, clock).with_persisted(persisted);
        assert_eq!(cache.budget().await.current_bytes, 10);
        assert!(cache.get("A").await.unwrap().is_some());
        assert_eq!(cache.budget().await.current_bytes, 10);
        assert_eq!(cache.recency_order().await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_clear_empties_both_tiers() {
        let clock = Arc::new(ManualClock::new(1_000));
        let persisted = Arc::new(MemoryStorage::new());
        let cache = TieredCache::new("api-v1", 100, clock).with_persisted(persisted.clone());
        cache.set(entry("A", 10, 60_000, 1_000)).await.unwrap();
        cache.clear().await.unwrap();

        assert!(cache.keys().await.unwrap().is_empty());
        assert_eq!(persisted.len().await.unwrap(), 0);
        assert_eq!(cache.budget().await.current_bytes, 0);
    }

    /// Longest suffix of `sizes` whose total fits in `max`.
    fn fitting_suffix(sizes: &[u64], max: u64) -> Vec<String> {
        let mut total = 0;
        let mut start = sizes.len();
        for (i, size) in sizes.iter().enumerate().rev() {
            if total + size > max {
                break;
            }
            total += size;
            start = i;
        }
        (start..sizes.len()).map(|i| format!("k{i}")).collect()
    }

    proptest! {
        #[test]
        fn prop_budget_holds_and_survivors_are_most_recent(
            max in 10u64..200,
            sizes in proptest::collection::vec(1u64..50, 1..40),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let sizes: Vec<u64> = sizes.into_iter().map(|s| s.min(max)).collect();
            let (survivors, budget) = runtime.block_on(async {
                let (cache, _) = cache(max);
                for (i, size) in sizes.iter().enumerate() {
                    cache
                        .set(entry(&format!("k{i}"), *size as usize, 60_000, 1_000))
                        .await
                        .unwrap();
                    let budget = cache.budget().await;
                    assert!(budget.current_bytes <= budget.max_bytes);
                }
                (cache.recency_order().await, cache.budget().await)
            });

            prop_assert!(budget.current_bytes <= max);
            prop_assert_eq!(survivors, fitting_suffix(&sizes, max));
        }
    }
}
