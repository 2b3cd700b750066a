//! Persisted-tier storage backends

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::RwLock};
use tracing::debug;

use crate::entry::CacheEntry;
use crate::{CacheError, Result};

/// What the eviction sweep needs to know about a stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntryMeta {
    pub key: String,
    pub written_at: u64,
    pub ttl_ms: u64,
    /// Bytes the entry occupies in this backend (counted against its quota)
    pub stored_bytes: u64,
    /// Payload bytes, as counted by the namespace budget
    pub size_bytes: u64,
}

/// Cache storage trait
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Store an entry. Backends with a quota fail with
    /// [`CacheError::QuotaExceeded`] instead of writing.
    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()>;

    /// Retrieve an entry
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Remove an entry
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Check if key exists
    async fn contains(&self, key: &str) -> Result<bool>;

    /// Clear all entries
    async fn clear(&self) -> Result<()>;

    /// Get number of entries
    async fn len(&self) -> Result<usize>;

    /// Get total size in bytes
    async fn size_bytes(&self) -> Result<u64>;

    /// Get all keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Metadata for every stored entry
    async fn index(&self) -> Result<Vec<StoredEntryMeta>>;
}

fn encoded_len(entry: &CacheEntry) -> Result<u64> {
    serde_json::to_vec(entry)
        .map(|v| v.len() as u64)
        .map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })
}

/// In-memory storage, optionally bounded by a byte quota measured on the
/// serialized form of each entry.
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<String, (CacheEntry, u64)>>>,
    quota_bytes: Option<u64>,
}

impl MemoryStorage {
    /// Create new in-memory storage
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            quota_bytes: None,
        }
    }

    /// Create storage that rejects writes beyond `quota_bytes`
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            quota_bytes: Some(quota_bytes),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let size = encoded_len(entry)?;
        let mut data = self.data.write().await;

        if let Some(quota) = self.quota_bytes {
            let used: u64 = data
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, (_, bytes))| *bytes)
                .sum();
            if used + size > quota {
                return Err(CacheError::QuotaExceeded {
                    requested: size,
                    available: quota.saturating_sub(used),
                });
            }
        }

        data.insert(key.to_string(), (entry.clone(), size));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let data = self.data.read().await;
        Ok(data.get(key).map(|(entry, _)| entry.clone()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }

    async fn clear(&self) -> Result<()> {
        let mut data = self.data.write().await;
        data.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let data = self.data.read().await;
        Ok(data.len())
    }

    async fn size_bytes(&self) -> Result<u64> {
        let data = self.data.read().await;
        Ok(data.values().map(|(_, bytes)| *bytes).sum())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let data = self.data.read().await;
        Ok(data.keys().cloned().collect())
    }

    async fn index(&self) -> Result<Vec<StoredEntryMeta>> {
        let data = self.data.read().await;
        Ok(data
            .iter()
            .map(|(key, (entry, bytes))| StoredEntryMeta {
                key: key.clone(),
                written_at: entry.written_at,
                ttl_ms: entry.ttl_ms,
                stored_bytes: *bytes,
                size_bytes: entry.size_bytes,
            })
            .collect())
    }
}

/// Disk-based cache storage: one JSON file per entry, file names are the
/// hex-encoded key so arbitrary URLs round-trip.
pub struct DiskStorage {
    base_path: PathBuf,
    quota_bytes: Option<u64>,
}

const ENTRY_EXTENSION: &str = "cache";

impl DiskStorage {
    /// Create new disk storage with base path
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            quota_bytes: None,
        }
    }

    /// Create disk storage that rejects writes beyond `quota_bytes`
    pub fn with_quota<P: AsRef<Path>>(base_path: P, quota_bytes: u64) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get file path for a key
    fn key_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", hex::encode(key.as_bytes()), ENTRY_EXTENSION))
    }

    fn path_key(path: &Path) -> Option<String> {
        if path.extension().map_or(true, |ext| ext != ENTRY_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Ensure base directory exists
    async fn ensure_base_dir(&self) -> Result<()> {
        if !fs::try_exists(&self.base_path).await? {
            fs::create_dir_all(&self.base_path).await?;
            debug!("Created cache directory: {}", self.base_path.display());
        }
        Ok(())
    }

    async fn entry_files(&self) -> Result<Vec<(String, PathBuf, u64)>> {
        if !fs::try_exists(&self.base_path).await? {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(key) = Self::path_key(&path) {
                let len = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                files.push((key, path, len));
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        self.ensure_base_dir().await?;

        let file_path = self.key_path(key);
        let json_data = serde_json::to_vec(entry).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })?;

        if let Some(quota) = self.quota_bytes {
            let used: u64 = self
                .entry_files()
                .await?
                .into_iter()
                .filter(|(k, _, _)| k != key)
                .map(|(_, _, len)| len)
                .sum();
            let requested = json_data.len() as u64;
            if used + requested > quota {
                return Err(CacheError::QuotaExceeded {
                    requested,
                    available: quota.saturating_sub(used),
                });
            }
        }

        fs::write(&file_path, json_data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let file_path = self.key_path(key);

        if !fs::try_exists(&file_path).await? {
            return Ok(None);
        }

        let json_data = fs::read(&file_path).await?;
        let entry: CacheEntry =
            serde_json::from_slice(&json_data).map_err(|e| CacheError::Deserialization {
                message: e.to_string(),
            })?;

        Ok(Some(entry))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let file_path = self.key_path(key);

        if fs::try_exists(&file_path).await? {
            fs::remove_file(&file_path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.key_path(key)).await?)
    }

    async fn clear(&self) -> Result<()> {
        for (_, path, _) in self.entry_files().await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entry_files().await?.len())
    }

    async fn size_bytes(&self) -> Result<u64> {
        Ok(self.entry_files().await?.iter().map(|(_, _, len)| len).sum())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .entry_files()
            .await?
            .into_iter()
            .map(|(key, _, _)| key)
            .collect())
    }

    async fn index(&self) -> Result<Vec<StoredEntryMeta>> {
        let mut index = Vec::new();
        for (key, _, stored_bytes) in self.entry_files().await? {
            // Unreadable files still occupy quota; treat them as oldest.
            let (written_at, ttl_ms, size_bytes) = match self.get(&key).await {
                Ok(Some(entry)) => (entry.written_at, entry.ttl_ms, entry.size_bytes),
                _ => (0, 0, stored_bytes),
            };
            index.push(StoredEntryMeta {
                key,
                written_at,
                ttl_ms,
                stored_bytes,
                size_bytes,
            });
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use progload_domain::Payload;
    use tempfile::TempDir;

    use super::*;

    fn entry(key: &str, bytes: usize) -> CacheEntry {
        CacheEntry::new(key, Payload::Bytes(vec![7; bytes]), "image/jpeg", 60_000, 1_000)
    }

    #[tokio::test]
    async fn test_memory_storage_basic_operations() {
        let storage = MemoryStorage::new();

        storage.set("GET /a", &entry("GET /a", 3)).await.unwrap();
        let retrieved = storage.get("GET /a").await.unwrap().unwrap();
        assert_eq!(retrieved.payload, Payload::Bytes(vec![7; 3]));

        assert!(storage.contains("GET /a").await.unwrap());
        assert!(!storage.contains("GET /b").await.unwrap());

        assert!(storage.remove("GET /a").await.unwrap());
        assert!(!storage.contains("GET /a").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_storage_quota() {
        let one = encoded_len(&entry("GET /a", 10)).unwrap();
        let storage = MemoryStorage::with_quota(one + one / 2);

        storage.set("GET /a", &entry("GET /a", 10)).await.unwrap();
        // Overwriting the same key does not double count
        storage.set("GET /a", &entry("GET /a", 10)).await.unwrap();

        let err = storage.set("GET /b", &entry("GET /b", 10)).await.unwrap_err();
        assert!(err.is_quota());
        assert_eq!(storage.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disk_storage_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DiskStorage::new(temp_dir.path().join("static-v1"));

        let key = "GET /img/x.jpg?w=200";
        storage.set(key, &entry(key, 5)).await.unwrap();
        let retrieved = storage.get(key).await.unwrap().unwrap();
        assert_eq!(retrieved.key, key);

        assert_eq!(storage.keys().await.unwrap(), vec![key.to_string()]);
        assert_eq!(storage.len().await.unwrap(), 1);

        let index = storage.index().await.unwrap();
        assert_eq!(index[0].written_at, 1_000);
        assert!(index[0].stored_bytes > 0);

        assert!(storage.remove(key).await.unwrap());
        assert!(!storage.contains(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_storage_quota_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let one = encoded_len(&entry("GET /a", 50)).unwrap();
        let storage = DiskStorage::with_quota(temp_dir.path(), one + 10);

        storage.set("GET /a", &entry("GET /a", 50)).await.unwrap();
        let err = storage.set("GET /b", &entry("GET /b", 50)).await.unwrap_err();
        match err {
            CacheError::QuotaExceeded { requested, available } => {
                assert_eq!(requested, one);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected error: {other}"),
        }

        storage.clear().await.unwrap();
        assert_eq!(storage.len().await.unwrap(), 0);
        assert_eq!(storage.size_bytes().await.unwrap(), 0);
    }
}
