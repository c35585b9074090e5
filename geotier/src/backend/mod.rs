//! Regional key-value backends.
//!
//! The engine only needs the small Redis-shaped contract in [`CacheBackend`];
//! each region gets its own instance, created through a [`BackendConnector`]
//! and held by the [`RegionBackendPool`].

pub mod memory;
pub mod pattern;
pub mod pool;
#[cfg(feature = "redis")]
pub mod redis_backend;

use crate::config::{BackendKind, RegionBackendConfig};
use crate::core::clock::SharedClock;
use crate::core::error::Result;
use crate::core::types::Region;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub use memory::{MemoryBackend, MemoryBackendConfig, MemoryStats};
pub use pattern::{escape_glob, glob_match};
pub use pool::RegionBackendPool;

/// `ttl` result for a key that does not exist or has already expired
pub const TTL_MISSING: i64 = -2;
/// `ttl` result for a key without expiry
pub const TTL_PERSISTENT: i64 = -1;

/// Minimal key-value contract a regional store must provide.
///
/// Each call is expected to be atomic for the key(s) it touches.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend name for logs
    fn kind(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, expiring after `ttl_secs` (must be positive)
    async fn setex(&self, key: &str, ttl_secs: u64, value: Vec<u8>) -> Result<()>;

    /// Like `setex`, but only if `key` still holds exactly `expected`.
    ///
    /// Returns false, leaving the key alone, when it was changed, removed or
    /// expired since `expected` was read.
    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        ttl_secs: u64,
        value: Vec<u8>,
    ) -> Result<bool>;

    /// Remove keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Keys matching a glob pattern (`*`, `?`, `[...]`, `\` escapes)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Remaining seconds, [`TTL_PERSISTENT`] or [`TTL_MISSING`]
    async fn ttl(&self, key: &str) -> Result<i64>;

    async fn flushdb(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Release connections; later calls fail
    async fn close(&self) -> Result<()>;
}

/// Shared handle to a regional backend
pub type BackendHandle = Arc<dyn CacheBackend>;

/// Creates the backend for a region from its configuration
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, region: Region, config: &RegionBackendConfig) -> Result<BackendHandle>;
}

/// Connector for the built-in backend kinds
#[derive(Clone)]
pub struct DefaultConnector {
    clock: SharedClock,
    ttl_sweep_interval_ms: Option<u64>,
}

impl DefaultConnector {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            ttl_sweep_interval_ms: None,
        }
    }

    /// Start a background expiry sweep on every memory backend created
    pub fn with_ttl_sweep(mut self, interval_ms: u64) -> Self {
        self.ttl_sweep_interval_ms = Some(interval_ms).filter(|ms| *ms > 0);
        self
    }
}

#[async_trait]
impl BackendConnector for DefaultConnector {
    async fn connect(&self, region: Region, config: &RegionBackendConfig) -> Result<BackendHandle> {
        config.validate()?;
        debug!(
            "Connecting {:?} backend for region {} ({}:{})",
            config.backend, region, config.host, config.port
        );

        match config.backend {
            BackendKind::Memory => {
                let backend =
                    MemoryBackend::with_clock(MemoryBackendConfig::from(config), self.clock.clone());
                if let Some(interval_ms) = self.ttl_sweep_interval_ms {
                    backend.start_ttl_cleanup(interval_ms);
                }
                Ok(Arc::new(backend))
            }
            #[cfg(feature = "redis")]
            BackendKind::Redis => Ok(Arc::new(redis_backend::RedisBackend::connect(config).await?)),
            #[cfg(not(feature = "redis"))]
            BackendKind::Redis => Err(crate::core::error::CacheError::Configuration(format!(
                "region {} requests the redis backend, but geotier was built without the `redis` feature",
                region
            ))),
        }
    }
}
