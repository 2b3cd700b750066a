//! Versioned cache namespaces
//!
//! A namespace is addressed by its version-suffixed name (`static-v1`). The
//! persisted tier of each namespace lives in its own directory below the
//! storage root, named the same way, so purging a version is a directory
//! delete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use progload_domain::SignalReporter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::entry::CacheEntry;
use crate::metrics::{CacheMetrics, CacheStats};
use crate::storage::{CacheStorage, DiskStorage, MemoryStorage};
use crate::tiered::{Lookup, SetOutcome, TieredCache};
use crate::{CacheError, Result};

/// Caching policy applied to every request routed to a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

/// Declared configuration of one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceSpec {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub policy: CachePolicy,
    /// Byte budget shared by both tiers
    pub max_bytes: u64,
    /// TTL used when the response carries no freshness headers
    pub ttl_ms: u64,
    /// Keep a persisted tier next to the memory tier
    #[serde(default)]
    pub persist: bool,
    /// Quota of the persisted tier; unbounded when absent
    #[serde(default)]
    pub persisted_quota_bytes: Option<u64>,
}

fn default_version() -> u32 {
    1
}

impl NamespaceSpec {
    pub fn new(name: impl Into<String>, policy: CachePolicy, max_bytes: u64, ttl_ms: u64) -> Self {
        Self {
            name: name.into(),
            version: 1,
            policy,
            max_bytes,
            ttl_ms,
            persist: false,
            persisted_quota_bytes: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Version-suffixed name, e.g. `api-v2`
    pub fn full_name(&self) -> String {
        versioned_name(&self.name, self.version)
    }
}

pub fn versioned_name(name: &str, version: u32) -> String {
    format!("{}-v{}", name, version)
}

/// Split `static-v3` into `("static", 3)`.
pub fn parse_versioned_name(full: &str) -> Option<(&str, u32)> {
    let (name, version) = full.rsplit_once("-v")?;
    if name.is_empty() {
        return None;
    }
    Some((name, version.parse().ok()?))
}

/// An opened namespace. Cheap to clone.
#[derive(Clone)]
pub struct NamespaceHandle {
    inner: Arc<Namespace>,
}

struct Namespace {
    spec: NamespaceSpec,
    cache: TieredCache,
}

impl NamespaceHandle {
    pub fn spec(&self) -> &NamespaceSpec {
        &self.inner.spec
    }

    pub fn name(&self) -> &str {
        self.inner.cache.name()
    }

    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    pub fn now_ms(&self) -> u64 {
        self.inner.cache.now_ms()
    }

    /// Fresh entry for `key`, or `None`
    pub async fn match_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.inner.cache.get(key).await
    }

    /// Entry for `key` even if its TTL ran out
    pub async fn match_allow_stale(&self, key: &str) -> Result<Option<Lookup>> {
        self.inner.cache.get_allow_stale(key).await
    }

    /// Store `entry`, evicting to stay within `max_bytes` first
    pub async fn put(&self, entry: CacheEntry) -> Result<SetOutcome> {
        self.inner.cache.set(entry).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.cache.remove(key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.inner.cache.keys().await
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.cache.metrics().snapshot()
    }
}

/// Registry of namespaces keyed by version-suffixed name.
pub struct CacheNamespaceStore {
    declared: HashMap<String, NamespaceSpec>,
    storage_root: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    reporter: SignalReporter,
    open: RwLock<HashMap<String, NamespaceHandle>>,
}

impl CacheNamespaceStore {
    pub fn new(
        specs: impl IntoIterator<Item = NamespaceSpec>,
        storage_root: Option<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let declared = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Self {
            declared,
            storage_root,
            clock,
            reporter: SignalReporter::disconnected(),
            open: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_reporter(mut self, reporter: SignalReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn storage_root(&self) -> Option<&Path> {
        self.storage_root.as_deref()
    }

    /// Declared settings for a short name (`api`)
    pub fn spec(&self, name: &str) -> Option<&NamespaceSpec> {
        self.declared.get(name)
    }

    /// Current version of every declared namespace
    pub fn declared_versions(&self) -> HashMap<String, u32> {
        self.declared
            .values()
            .map(|spec| (spec.name.clone(), spec.version))
            .collect()
    }

    /// Open the declared namespace `name` at its current version. Repeated
    /// opens return the same handle.
    pub fn open(&self, name: &str) -> Result<NamespaceHandle> {
        let spec = self
            .declared
            .get(name)
            .ok_or_else(|| CacheError::UnknownNamespace {
                name: name.to_string(),
            })?;
        let full_name = spec.full_name();

        if let Some(handle) = self.open.read().get(&full_name) {
            return Ok(handle.clone());
        }

        let mut open = self.open.write();
        let handle = open
            .entry(full_name.clone())
            .or_insert_with(|| self.build_handle(spec, &full_name))
            .clone();
        Ok(handle)
    }

    fn build_handle(&self, spec: &NamespaceSpec, full_name: &str) -> NamespaceHandle {
        let mut cache = TieredCache::new(full_name, spec.max_bytes, self.clock.clone())
            .with_metrics(CacheMetrics::new())
            .with_reporter(self.reporter.clone());

        if spec.persist {
            let quota = spec.persisted_quota_bytes;
            let storage: Arc<dyn CacheStorage> = match (&self.storage_root, quota) {
                (Some(root), Some(quota)) => {
                    Arc::new(DiskStorage::with_quota(root.join(full_name), quota))
                }
                (Some(root), None) => Arc::new(DiskStorage::new(root.join(full_name))),
                (None, Some(quota)) => Arc::new(MemoryStorage::with_quota(quota)),
                (None, None) => Arc::new(MemoryStorage::new()),
            };
            cache = cache.with_persisted(storage);
        }

        debug!("Opened cache namespace {}", full_name);
        NamespaceHandle {
            inner: Arc::new(Namespace {
                spec: spec.clone(),
                cache,
            }),
        }
    }

    /// Delete every namespace whose version differs from `current`, and every
    /// namespace `current` does not mention. Returns the deleted names.
    pub async fn purge_stale(&self, current: &HashMap<String, u32>) -> Result<Vec<String>> {
        let is_current = |full: &str| match parse_versioned_name(full) {
            Some((name, version)) => current.get(name) == Some(&version),
            None => false,
        };

        let mut purged = Vec::new();

        let stale_handles: Vec<(String, NamespaceHandle)> = {
            let mut open = self.open.write();
            let stale: Vec<String> = open.keys().filter(|k| !is_current(k)).cloned().collect();
            stale
                .into_iter()
                .filter_map(|name| open.remove(&name).map(|handle| (name, handle)))
                .collect()
        };
        for (name, handle) in stale_handles {
            handle.cache().clear().await?;
            info!("Purged cache namespace {}", name);
            purged.push(name);
        }

        if let Some(ref root) = self.storage_root {
            if fs::try_exists(root).await? {
                let mut dirs = fs::read_dir(root).await?;
                while let Some(dir) = dirs.next_entry().await? {
                    if !dir.file_type().await?.is_dir() {
                        continue;
                    }
                    let Some(name) = dir.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if is_current(&name) {
                        continue;
                    }
                    match fs::remove_dir_all(dir.path()).await {
                        Ok(()) => {
                            info!("Purged persisted namespace {}", name);
                            if !purged.contains(&name) {
                                purged.push(name);
                            }
                        }
                        Err(e) => warn!("Failed to purge persisted namespace {}: {}", name, e),
                    }
                }
            }
        }

        purged.sort();
        Ok(purged)
    }

    /// Full names of the namespaces opened so far
    pub fn open_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.open.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Per-namespace counters of every open namespace
    pub fn stats(&self) -> HashMap<String, CacheStats> {
        self.open
            .read()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.stats()))
            .collect()
    }

    /// Clear both tiers of every open namespace and forget the handles
    pub async fn teardown(&self) -> Result<()> {
        let handles: Vec<NamespaceHandle> = self.open.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.cache().clear().await?;
        }
        info!("Cache namespaces torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use progload_domain::Payload;
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_000))
    }

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(key, Payload::Bytes(vec![7; 8]), "image/png", 60_000, 1_000)
    }

    #[test]
    fn test_versioned_names() {
        let spec =
            NamespaceSpec::new("static", CachePolicy::CacheFirst, 100, 1_000).with_version(3);
        assert_eq!(spec.full_name(), "static-v3");
        assert_eq!(parse_versioned_name("static-v3"), Some(("static", 3)));
        assert_eq!(parse_versioned_name("my-vendor-v12"), Some(("my-vendor", 12)));
        assert_eq!(parse_versioned_name("static"), None);
        assert_eq!(parse_versioned_name("-v1"), None);
    }

    #[test]
    fn test_policy_serde() {
        let policy: CachePolicy = serde_yaml::from_str("stale-while-revalidate").unwrap();
        assert_eq!(policy, CachePolicy::StaleWhileRevalidate);
    }

    #[tokio::test]
    async fn test_open_returns_same_handle() {
        let store = CacheNamespaceStore::new(
            vec![NamespaceSpec::new("images", CachePolicy::CacheFirst, 100, 60_000)],
            None,
            clock(),
        );
        let first = store.open("images").unwrap();
        first.put(entry("GET /a.png")).await.unwrap();
        let second = store.open("images").unwrap();
        assert!(second.match_entry("GET /a.png").await.unwrap().is_some());
        assert_eq!(second.name(), "images-v1");
    }

    #[test]
    fn test_open_unknown_namespace() {
        let store = CacheNamespaceStore::new(Vec::new(), None, clock());
        assert!(matches!(
            store.open("nope"),
            Err(CacheError::UnknownNamespace { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_removes_old_versions_on_disk() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let old = CacheNamespaceStore::new(
            vec![
                NamespaceSpec::new("static", CachePolicy::CacheFirst, 100, 60_000).persisted(),
                NamespaceSpec::new("legacy", CachePolicy::CacheFirst, 100, 60_000).persisted(),
            ],
            Some(root.clone()),
            clock(),
        );
        old.open("static").unwrap().put(entry("GET /app.js")).await.unwrap();
        old.open("legacy").unwrap().put(entry("GET /old.js")).await.unwrap();
        assert!(root.join("static-v1").exists());

        let new = CacheNamespaceStore::new(
            vec![
                NamespaceSpec::new("static", CachePolicy::CacheFirst, 100, 60_000)
                    .with_version(2)
                    .persisted(),
            ],
            Some(root.clone()),
            clock(),
        );
        new.open("static").unwrap().put(entry("GET /app.js")).await.unwrap();

        let purged = new.purge_stale(&new.declared_versions()).await.unwrap();
        assert_eq!(purged, vec!["legacy-v1".to_string(), "static-v1".to_string()]);
        assert!(!root.join("static-v1").exists());
        assert!(!root.join("legacy-v1").exists());
        assert!(root.join("static-v2").exists());
    }

    #[tokio::test]
    async fn test_purge_drops_open_handles_of_old_versions() {
        let store = CacheNamespaceStore::new(
            vec![NamespaceSpec::new("api", CachePolicy::NetworkFirst, 100, 60_000)],
            None,
            clock(),
        );
        let handle = store.open("api").unwrap();
        handle.put(entry("GET /api/a")).await.unwrap();

        let mut bumped = HashMap::new();
        bumped.insert("api".to_string(), 2);
        let purged = store.purge_stale(&bumped).await.unwrap();

        assert_eq!(purged, vec!["api-v1".to_string()]);
        assert!(handle.keys().await.unwrap().is_empty());
        assert!(store.open_names().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_clears_everything() {
        let store = CacheNamespaceStore::new(
            vec![
                NamespaceSpec::new("dynamic", CachePolicy::StaleWhileRevalidate, 100, 60_000)
                    .persisted(),
            ],
            None,
            clock(),
        );
        let handle = store.open("dynamic").unwrap();
        handle.put(entry("GET /page")).await.unwrap();
        store.teardown().await.unwrap();

        assert!(handle.keys().await.unwrap().is_empty());
        assert!(store.open_names().is_empty());
    }
}
