//! Redis regional backend (feature `redis`)

use super::CacheBackend;
use crate::config::RegionBackendConfig;
use crate::core::error::{CacheError, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info, warn};

/// SETEX guarded by a comparison with the current value, run atomically server-side
const REPLACE_IF_UNCHANGED: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SETEX', KEYS[1], ARGV[2], ARGV[3])
    return 1
end
return 0
";

/// Backend talking to one Redis database over a multiplexed connection.
///
/// Concurrent commands are bounded by `max_connections`.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    permits: Arc<Semaphore>,
    endpoint: String,
    replace_script: redis::Script,
    closed: AtomicBool,
}

impl RedisBackend {
    /// Connect, applying the configured `maxmemory` ceiling when the region
    /// owns the server (see [`owns_server_memory`])
    pub async fn connect(config: &RegionBackendConfig) -> Result<Self> {
        let endpoint = config.url();
        let client = redis::Client::open(endpoint.as_str()).map_err(backend_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend_err)?;

        let backend = Self {
            conn,
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            endpoint,
            replace_script: redis::Script::new(REPLACE_IF_UNCHANGED),
            closed: AtomicBool::new(false),
        };
        if owns_server_memory(config) {
            backend.apply_memory_limit(config.max_memory).await;
        } else {
            warn!(
                "Region on {} uses db {}; leaving the server-wide maxmemory to the db 0 owner \
                 (configured {}MB not applied)",
                backend.endpoint, config.db, config.max_memory
            );
        }

        info!("Connected to Redis backend at {}", backend.endpoint);
        Ok(backend)
    }

    /// Best effort: managed Redis offerings often reject CONFIG.
    /// `maxmemory` applies to the whole server, not to one db.
    async fn apply_memory_limit(&self, max_memory_mb: usize) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory")
            .arg(format!("{}mb", max_memory_mb))
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!(
                "Set server-wide maxmemory={}MB on {}",
                max_memory_mb, self.endpoint
            ),
            Err(e) => warn!(
                "Could not set maxmemory={}MB on {}: {}",
                max_memory_mb, self.endpoint, e
            ),
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| CacheError::BackendIo(format!("{} is closed", self.endpoint)))
    }
}

/// Only the region on db 0 sets the server-wide memory ceiling, so regions
/// sharing one Redis server on other dbs cannot overwrite each other's limit
pub fn owns_server_memory(config: &RegionBackendConfig) -> bool {
    config.db == 0
}

fn backend_err(err: redis::RedisError) -> CacheError {
    CacheError::BackendIo(err.to_string())
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _permit = self.permit().await?;
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(value)
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: Vec<u8>) -> Result<()> {
        let _permit = self.permit().await?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        ttl_secs: u64,
        value: Vec<u8>,
    ) -> Result<bool> {
        let _permit = self.permit().await?;
        let mut conn = self.conn.clone();
        let replaced: i64 = self
            .replace_script
            .key(key)
            .arg(expected)
            .arg(ttl_secs)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(replaced == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let _permit = self.permit().await?;
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let _permit = self.permit().await?;
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let _permit = self.permit().await?;
        let mut conn = self.conn.clone();
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(ttl)
    }

    async fn flushdb(&self) -> Result<()> {
        let _permit = self.permit().await?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _permit = self.permit().await?;
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        if pong != "PONG" {
            return Err(CacheError::BackendIo(format!(
                "unexpected PING reply from {}: {}",
                self.endpoint, pong
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The multiplexed connection shuts down when its last clone is dropped
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.permits.close();
            info!("Closed Redis backend at {}", self.endpoint);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_db_zero_owns_server_memory() {
        let owner = RegionBackendConfig::default();
        assert!(owns_server_memory(&owner));

        let shared = RegionBackendConfig {
            db: 3,
            ..RegionBackendConfig::default()
        };
        assert!(!owns_server_memory(&shared));
    }
}
