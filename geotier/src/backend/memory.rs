use super::pattern::{glob_match, literal_prefix};
use super::{CacheBackend, TTL_MISSING, TTL_PERSISTENT};
use crate::config::RegionBackendConfig;
use crate::core::clock::{SharedClock, SystemClock};
use crate::core::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

/// Stored value with its expiry
#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// Limits for the in-process backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBackendConfig {
    /// Maximum memory in MB
    pub max_memory_mb: usize,
    /// Maximum concurrent operations
    pub max_connections: usize,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            max_connections: 50,
        }
    }
}

impl From<&RegionBackendConfig> for MemoryBackendConfig {
    fn from(config: &RegionBackendConfig) -> Self {
        Self {
            max_memory_mb: config.max_memory,
            max_connections: config.max_connections,
        }
    }
}

/// Statistics for the in-process backend
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    /// Total number of keys, including expired ones not yet evicted
    pub total_keys: usize,
    /// Estimated memory usage in bytes
    pub total_memory_bytes: usize,
}

/// In-process backend using a radix trie for prefix scans.
///
/// Expired keys are evicted lazily when read or by the optional sweep task;
/// until then they remain visible to `keys` and report [`TTL_MISSING`] from
/// `ttl`, like a Redis key that has expired but not been reclaimed.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<Trie<String, StoredValue>>>,
    stats: Arc<RwLock<MemoryStats>>,
    config: MemoryBackendConfig,
    permits: Arc<Semaphore>,
    clock: SharedClock,
    closed: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new(config: MemoryBackendConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a backend whose expiry follows `clock`
    pub fn with_clock(config: MemoryBackendConfig, clock: SharedClock) -> Self {
        info!(
            "Initializing memory backend with max_memory={}MB, max_connections={}",
            config.max_memory_mb, config.max_connections
        );

        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(MemoryStats::default())),
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config,
            clock,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start background TTL cleanup task; it stops once the backend is closed
    pub fn start_ttl_cleanup(&self, interval_ms: u64) -> tokio::task::JoinHandle<()> {
        info!("Starting TTL cleanup task (interval={}ms)", interval_ms);

        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));

            loop {
                interval.tick().await;
                if store.closed.load(Ordering::Acquire) {
                    debug!("Memory backend closed, stopping TTL cleanup");
                    break;
                }
                store.cleanup_expired();
            }
        })
    }

    /// Get statistics
    pub fn stats(&self) -> MemoryStats {
        self.stats.read().clone()
    }

    /// Remove every expired key, returning how many were evicted
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut data = self.data.write();

        let expired_keys: Vec<String> = data
            .iter()
            .filter(|(_, v)| v.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        let count = expired_keys.len();
        if count > 0 {
            debug!("Cleaning up {} expired keys", count);
            let mut stats = self.stats.write();
            for key in expired_keys {
                if let Some(value) = data.remove(&key) {
                    Self::forget(&mut stats, &key, &value);
                }
            }
        }
        count
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| CacheError::BackendIo("memory backend is closed".to_string()))
    }

    fn expiring(&self, ttl_secs: u64, value: Vec<u8>) -> Result<StoredValue> {
        if ttl_secs == 0 {
            return Err(CacheError::BackendIo(
                "invalid expire time in 'setex'".to_string(),
            ));
        }
        Ok(StoredValue {
            data: value,
            expires_at: Some(self.clock.now() + ChronoDuration::seconds(ttl_secs as i64)),
        })
    }

    /// Insert under already-held locks, enforcing the memory ceiling
    fn insert_locked(
        &self,
        data: &mut Trie<String, StoredValue>,
        stats: &mut MemoryStats,
        key: &str,
        stored: StoredValue,
    ) -> Result<()> {
        let entry_size = Self::estimate_entry_size(key, &stored);
        let replaced_size = data
            .get(key)
            .map(|old| Self::estimate_entry_size(key, old))
            .unwrap_or(0);

        // Check memory limits
        let max_bytes = self.config.max_memory_mb * 1024 * 1024;
        let projected = stats.total_memory_bytes.saturating_sub(replaced_size) + entry_size;
        if projected > max_bytes {
            warn!(
                "Memory limit exceeded: {}/{}",
                stats.total_memory_bytes, max_bytes
            );
            return Err(CacheError::MemoryLimitExceeded);
        }

        if data.insert(key.to_string(), stored).is_none() {
            stats.total_keys += 1;
        }
        stats.total_memory_bytes = projected;
        Ok(())
    }

    fn forget(stats: &mut MemoryStats, key: &str, value: &StoredValue) {
        stats.total_keys = stats.total_keys.saturating_sub(1);
        stats.total_memory_bytes = stats
            .total_memory_bytes
            .saturating_sub(Self::estimate_entry_size(key, value));
    }

    /// Estimate memory size of an entry
    fn estimate_entry_size(key: &str, value: &StoredValue) -> usize {
        key.len() + value.data.len() + std::mem::size_of::<StoredValue>()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(MemoryBackendConfig::default())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _permit = self.permit().await?;
        let now = self.clock.now();

        let mut data = self.data.write();
        match data.get(key) {
            None => return Ok(None),
            Some(value) if !value.is_expired(now) => return Ok(Some(value.data.clone())),
            Some(_) => {}
        }

        debug!("Key expired: {}", key);
        if let Some(value) = data.remove(key) {
            Self::forget(&mut self.stats.write(), key, &value);
        }
        Ok(None)
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: Vec<u8>) -> Result<()> {
        let stored = self.expiring(ttl_secs, value)?;
        let _permit = self.permit().await?;

        let mut data = self.data.write();
        let mut stats = self.stats.write();
        self.insert_locked(&mut data, &mut stats, key, stored)
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        ttl_secs: u64,
        value: Vec<u8>,
    ) -> Result<bool> {
        let stored = self.expiring(ttl_secs, value)?;
        let _permit = self.permit().await?;
        let now = self.clock.now();

        let mut data = self.data.write();
        let unchanged = data
            .get(key)
            .is_some_and(|current| !current.is_expired(now) && current.data == expected);
        if !unchanged {
            return Ok(false);
        }

        let mut stats = self.stats.write();
        self.insert_locked(&mut data, &mut stats, key, stored)?;
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let _permit = self.permit().await?;
        let now = self.clock.now();

        let mut data = self.data.write();
        let mut stats = self.stats.write();
        let mut removed = 0;

        for key in keys {
            if let Some(value) = data.remove(key) {
                // An expired key no longer exists as far as callers are concerned
                if !value.is_expired(now) {
                    removed += 1;
                }
                Self::forget(&mut stats, key, &value);
            }
        }

        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let _permit = self.permit().await?;

        let data = self.data.read();
        let prefix = literal_prefix(pattern);
        let keys: Vec<String> = if prefix.is_empty() {
            data.keys()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect()
        } else {
            data.get_raw_descendant(prefix)
                .map(|subtrie| {
                    subtrie
                        .keys()
                        .filter(|k| glob_match(pattern, k))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let _permit = self.permit().await?;
        let now = self.clock.now();

        let data = self.data.read();
        Ok(match data.get(key) {
            None => TTL_MISSING,
            Some(value) if value.is_expired(now) => TTL_MISSING,
            Some(StoredValue {
                expires_at: None, ..
            }) => TTL_PERSISTENT,
            Some(StoredValue {
                expires_at: Some(expires),
                ..
            }) => (*expires - now).num_seconds(),
        })
    }

    async fn flushdb(&self) -> Result<()> {
        let _permit = self.permit().await?;

        *self.data.write() = Trie::new();
        *self.stats.write() = MemoryStats::default();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::BackendIo(
                "memory backend is closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.permits.close();
            info!("Memory backend closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn backend() -> (MemoryBackend, ManualClock) {
        let clock = ManualClock::default();
        let backend =
            MemoryBackend::with_clock(MemoryBackendConfig::default(), Arc::new(clock.clone()));
        (backend, clock)
    }

    #[tokio::test]
    async fn test_setex_get() {
        let (store, _) = backend();

        store.setex("key1", 60, b"value1".to_vec()).await.unwrap();

        let result = store.get("key1").await.unwrap();
        assert_eq!(result, Some(b"value1".to_vec()));
        assert_eq!(store.get("nonexistent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let (store, _) = backend();
        assert!(store.setex("key1", 0, b"v".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_replace_if_unchanged() {
        let (store, clock) = backend();

        store.setex("key1", 60, b"v1".to_vec()).await.unwrap();
        assert!(
            store
                .replace_if_unchanged("key1", b"v1", 30, b"v2".to_vec())
                .await
                .unwrap()
        );
        assert_eq!(store.get("key1").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.ttl("key1").await.unwrap(), 30);

        // Stale expectation leaves the newer value in place
        assert!(
            !store
                .replace_if_unchanged("key1", b"v1", 60, b"stale".to_vec())
                .await
                .unwrap()
        );
        assert_eq!(store.get("key1").await.unwrap(), Some(b"v2".to_vec()));

        // Deleted or expired keys are not recreated
        assert!(
            !store
                .replace_if_unchanged("missing", b"v1", 60, b"x".to_vec())
                .await
                .unwrap()
        );
        assert_eq!(store.get("missing").await.unwrap(), None);
        clock.advance_secs(31);
        assert!(
            !store
                .replace_if_unchanged("key1", b"v2", 60, b"x".to_vec())
                .await
                .unwrap()
        );
        assert_eq!(store.stats().total_keys, 1);
    }

    #[tokio::test]
    async fn test_delete_counts_existing_keys() {
        let (store, _) = backend();

        store.setex("key1", 60, b"value1".to_vec()).await.unwrap();
        store.setex("key2", 60, b"value2".to_vec()).await.unwrap();

        let keys = vec!["key1".to_string(), "key2".to_string(), "key4".to_string()];
        assert_eq!(store.delete(&keys).await.unwrap(), 2);
        assert_eq!(store.get("key1").await.unwrap(), None);
        assert_eq!(store.stats().total_keys, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let (store, clock) = backend();

        store.setex("key1", 1, b"value1".to_vec()).await.unwrap();
        assert_eq!(store.ttl("key1").await.unwrap(), 1);

        clock.advance_secs(2);

        // Still listed until touched, but reported as gone
        assert_eq!(store.keys("*").await.unwrap(), vec!["key1".to_string()]);
        assert_eq!(store.ttl("key1").await.unwrap(), TTL_MISSING);

        assert_eq!(store.get("key1").await.unwrap(), None);
        assert!(store.keys("*").await.unwrap().is_empty());
        assert_eq!(store.ttl("missing").await.unwrap(), TTL_MISSING);
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let (store, _) = backend();

        for key in [
            "l1_edge:tenant:42:a",
            "l1_edge:tenant:42:b",
            "l1_edge:tenant:7:a",
            "l2_regional:tenant:42:a",
        ] {
            store.setex(key, 60, b"x".to_vec()).await.unwrap();
        }

        let mut keys = store.keys("l1_edge:tenant:42:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["l1_edge:tenant:42:a", "l1_edge:tenant:42:b"]);

        assert_eq!(store.keys("*:tenant:42:a").await.unwrap().len(), 2);
        assert!(store.keys("l3_global:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (store, clock) = backend();

        store.setex("short", 1, b"x".to_vec()).await.unwrap();
        store.setex("long", 100, b"y".to_vec()).await.unwrap();
        clock.advance_secs(5);

        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.stats().total_keys, 1);
        assert_eq!(store.get("long").await.unwrap(), Some(b"y".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let store = MemoryBackend::new(MemoryBackendConfig {
            max_memory_mb: 1,
            max_connections: 4,
        });

        store.setex("big", 60, vec![0u8; 600 * 1024]).await.unwrap();
        assert!(matches!(
            store.setex("bigger", 60, vec![0u8; 600 * 1024]).await,
            Err(CacheError::MemoryLimitExceeded)
        ));
        // Overwriting the same key reuses its space
        store.setex("big", 60, vec![1u8; 600 * 1024]).await.unwrap();
    }

    #[tokio::test]
    async fn test_flushdb_and_close() {
        let (store, _) = backend();

        store.setex("key1", 60, b"v".to_vec()).await.unwrap();
        store.flushdb().await.unwrap();
        assert!(store.keys("*").await.unwrap().is_empty());
        assert_eq!(store.stats(), MemoryStats::default());

        store.ping().await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(store.ping().await.is_err());
        assert!(store.get("key1").await.is_err());
    }
}
