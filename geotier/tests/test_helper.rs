//! Test helper utilities for building cache engines over in-memory backends

#![allow(dead_code)]

use async_trait::async_trait;
use geotier::backend::MemoryBackendConfig;
use geotier::policy::default_policies;
use geotier::{
    CacheBackend, CacheError, Cipher, IdentityCipher, ManualClock, MemoryBackend, MultiTierCache,
    PolicyStore, Region, Result, SharedClock,
};
use std::sync::Arc;

/// Engine over memory backends for `regions`, driven by a manual clock
pub fn create_test_cache(regions: &[Region]) -> (MultiTierCache, ManualClock) {
    create_test_cache_with(
        regions,
        PolicyStore::from_policies(default_policies()).unwrap(),
        Arc::new(IdentityCipher),
    )
}

pub fn create_test_cache_with(
    regions: &[Region],
    policies: PolicyStore,
    cipher: Arc<dyn Cipher>,
) -> (MultiTierCache, ManualClock) {
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());

    let mut builder = MultiTierCache::builder(policies)
        .clock(shared.clone())
        .cipher(cipher);
    for region in regions {
        builder = builder.backend(*region, memory_backend(&shared));
    }
    (builder.build(), clock)
}

pub fn memory_backend(clock: &SharedClock) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_clock(
        MemoryBackendConfig::default(),
        clock.clone(),
    ))
}

/// Backend whose writes fail for keys starting with a prefix
pub struct FlakyBackend {
    inner: Arc<MemoryBackend>,
    failing_prefix: String,
}

impl FlakyBackend {
    pub fn new(inner: Arc<MemoryBackend>, failing_prefix: &str) -> Self {
        Self {
            inner,
            failing_prefix: failing_prefix.to_string(),
        }
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: Vec<u8>) -> Result<()> {
        if key.starts_with(&self.failing_prefix) {
            return Err(CacheError::BackendIo(format!("write to {} refused", key)));
        }
        self.inner.setex(key, ttl_secs, value).await
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        ttl_secs: u64,
        value: Vec<u8>,
    ) -> Result<bool> {
        if key.starts_with(&self.failing_prefix) {
            return Err(CacheError::BackendIo(format!("write to {} refused", key)));
        }
        self.inner
            .replace_if_unchanged(key, expected, ttl_secs, value)
            .await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.inner.delete(keys).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.inner.ttl(key).await
    }

    async fn flushdb(&self) -> Result<()> {
        self.inner.flushdb().await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Backend that lets another writer store `overwrite` right after the first
/// read of `key`, the way a concurrent `set` would land between a reader's
/// GET and its access update
pub struct InterleavedWriteBackend {
    inner: Arc<MemoryBackend>,
    key: String,
    overwrite: parking_lot::Mutex<Option<Vec<u8>>>,
}

impl InterleavedWriteBackend {
    pub fn new(inner: Arc<MemoryBackend>, key: &str, overwrite: Vec<u8>) -> Self {
        Self {
            inner,
            key: key.to_string(),
            overwrite: parking_lot::Mutex::new(Some(overwrite)),
        }
    }
}

#[async_trait]
impl CacheBackend for InterleavedWriteBackend {
    fn kind(&self) -> &'static str {
        "interleaved"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.inner.get(key).await?;
        if key == self.key {
            let pending = self.overwrite.lock().take();
            if let Some(bytes) = pending {
                self.inner.setex(key, 600, bytes).await?;
            }
        }
        Ok(value)
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: Vec<u8>) -> Result<()> {
        self.inner.setex(key, ttl_secs, value).await
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        ttl_secs: u64,
        value: Vec<u8>,
    ) -> Result<bool> {
        self.inner
            .replace_if_unchanged(key, expected, ttl_secs, value)
            .await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.inner.delete(keys).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.inner.ttl(key).await
    }

    async fn flushdb(&self) -> Result<()> {
        self.inner.flushdb().await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
