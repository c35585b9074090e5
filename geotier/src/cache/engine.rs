//! Multi-Tier Cache Engine
//!
//! Routes reads and writes to per-region backends and, inside a region, to the
//! edge/regional/global levels a policy declares. Entries are stored as JSON
//! envelopes under `level:logical_key`; the engine checks expiry and checksum
//! on every read, so stale or tampered data is never returned.

use super::stats::{RegionStats, StatsRegistry};
use crate::backend::{
    BackendConnector, BackendHandle, DefaultConnector, RegionBackendPool, TTL_MISSING,
    escape_glob,
};
use crate::compression::{CompressionAlgorithm, Compressor};
use crate::config::CacheConfig;
use crate::core::clock::{SharedClock, SystemClock};
use crate::core::entry::{CacheEntry, NO_CIPHER, checksum};
use crate::core::error::{CacheError, Result};
use crate::core::types::{CacheLevel, Region};
use crate::crypto::{AesGcmCipher, Cipher};
use crate::metrics;
use crate::policy::{CachePolicy, PolicyStore};
use crate::region::{RegionResolver, default_geo_ranges};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Duration;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// `optimize` recommends tuning below this hit rate
const HIT_RATE_THRESHOLD: f64 = 0.7;
/// Entries expiring within this window count as near expiry
const NEAR_EXPIRY_WINDOW_SECS: i64 = 300;
/// `optimize` recommends prefetching above this many near-expiry entries
const NEAR_EXPIRY_THRESHOLD: u64 = 1000;

/// Outcome of `optimize` for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionOptimization {
    pub region: Region,
    pub keys_scanned: u64,
    /// Expired keys found by the scan and reclaimed. The backend reports them
    /// as already gone, so this is not the count `delete` returns.
    pub expired_removed: u64,
    pub near_expiry: u64,
    pub hit_rate: f64,
}

/// Maintenance report returned by `optimize`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    /// Expired entries deleted across all scanned regions
    pub entries_removed: u64,
    pub recommendations: Vec<String>,
    pub regions: Vec<RegionOptimization>,
}

/// Region-aware multi-tier cache
pub struct MultiTierCache {
    pool: RegionBackendPool,
    policies: RwLock<Arc<PolicyStore>>,
    resolver: RegionResolver,
    lookup_order: Vec<Region>,
    compressor: Compressor,
    cipher: Arc<dyn Cipher>,
    stats: StatsRegistry,
    clock: SharedClock,
}

/// Assembles a [`MultiTierCache`] from already-built parts
pub struct CacheBuilder {
    policies: PolicyStore,
    resolver: Option<RegionResolver>,
    lookup_order: Vec<Region>,
    compressor: Compressor,
    cipher: Option<Arc<dyn Cipher>>,
    clock: SharedClock,
    pool: RegionBackendPool,
}

impl CacheBuilder {
    pub fn new(policies: PolicyStore) -> Self {
        Self {
            policies,
            resolver: None,
            lookup_order: CacheConfig::default().lookup_order(),
            compressor: Compressor::default(),
            cipher: None,
            clock: Arc::new(SystemClock),
            pool: RegionBackendPool::new(),
        }
    }

    pub fn resolver(mut self, resolver: RegionResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Region order for reads that do not name a region
    pub fn lookup_order(mut self, order: Vec<Region>) -> Self {
        self.lookup_order = order;
        self
    }

    pub fn compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attach a connected backend for a region
    pub fn backend(self, region: Region, backend: BackendHandle) -> Self {
        self.pool.insert(region, backend);
        self
    }

    pub fn pool(mut self, pool: RegionBackendPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn build(self) -> MultiTierCache {
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => RegionResolver::new(&default_geo_ranges(), Region::Americas)
                .unwrap_or_else(|_| RegionResolver::with_default(Region::Americas)),
        };

        MultiTierCache {
            pool: self.pool,
            policies: RwLock::new(Arc::new(self.policies)),
            resolver,
            lookup_order: self.lookup_order,
            compressor: self.compressor,
            cipher: self
                .cipher
                .unwrap_or_else(|| Arc::new(AesGcmCipher::random())),
            stats: StatsRegistry::new(),
            clock: self.clock,
        }
    }
}

impl MultiTierCache {
    pub fn builder(policies: PolicyStore) -> CacheBuilder {
        CacheBuilder::new(policies)
    }

    /// Build the engine from configuration, connecting every configured region
    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let connector = DefaultConnector::new(clock.clone())
            .with_ttl_sweep(config.maintenance.ttl_sweep_interval_ms);
        Self::from_config_with(config, clock, &connector).await
    }

    /// Like [`MultiTierCache::from_config`] with an explicit clock and connector.
    ///
    /// Invalid policies and unreachable regions are logged and skipped; only a
    /// malformed range table or encryption key fails the whole engine.
    pub async fn from_config_with(
        config: &CacheConfig,
        clock: SharedClock,
        connector: &dyn BackendConnector,
    ) -> Result<Self> {
        let resolver = RegionResolver::new(&config.geo_ranges, config.default_region)?;
        let cipher = config.encryption.build_cipher()?;
        let (policies, rejected) = PolicyStore::from_policies_partial(config.policies.clone());
        if !rejected.is_empty() {
            warn!("Rejected cache policies: {}", rejected.join(", "));
        }

        let pool = RegionBackendPool::new();
        for (region, backend_config) in &config.regions {
            pool.connect(*region, backend_config, connector).await;
        }

        let connected = pool.regions();
        if connected.is_empty() {
            warn!("No cache region is available; every operation will miss");
        }
        info!(
            "Geotier cache ready: {} policies, regions [{}]",
            policies.len(),
            connected
                .iter()
                .map(Region::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(CacheBuilder::new(policies)
            .resolver(resolver)
            .lookup_order(config.lookup_order())
            .compressor(Compressor::new(config.compression.clone()))
            .cipher(cipher)
            .clock(clock)
            .pool(pool)
            .build())
    }

    /// Current policy store
    pub fn policies(&self) -> Arc<PolicyStore> {
        self.policies.read().clone()
    }

    /// Replace the whole policy store
    pub fn reload_policies(&self, policies: PolicyStore) {
        info!("Reloading cache policies ({} defined)", policies.len());
        *self.policies.write() = Arc::new(policies);
    }

    /// Region serving a client address
    pub fn resolve_region(&self, ip_address: &str) -> Region {
        self.resolver.resolve(ip_address)
    }

    pub fn pool(&self) -> &RegionBackendPool {
        &self.pool
    }

    /// Look up a value.
    ///
    /// Without a region the connected regions are tried in lookup order; without
    /// a level, edge then regional then global. Backend failures, expired and
    /// corrupt entries all count as absent.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        region: Option<Region>,
        level: Option<CacheLevel>,
    ) -> Option<T> {
        let start = Instant::now();
        let regions = match region {
            Some(region) => vec![region],
            None => self.lookup_order.clone(),
        };
        let levels = match level {
            Some(level) => vec![level],
            None => CacheLevel::ALL.to_vec(),
        };

        let mut miss_region = region;
        for candidate in regions {
            let Some(backend) = self.pool.get_backend(candidate) else {
                if region.is_some() {
                    warn!("GET {} in unavailable region {}", key, candidate);
                    metrics::record_cache_op(candidate.as_str(), "get", "unavailable");
                }
                continue;
            };
            miss_region.get_or_insert(candidate);

            for level in &levels {
                if let Some(value) = self.read_level(&backend, candidate, *level, key).await {
                    debug!("GET {} hit at {} in {}", key, level, candidate);
                    self.stats.record_hit(candidate, self.clock.now());
                    metrics::record_cache_op(candidate.as_str(), "get", "hit");
                    metrics::observe_duration("get", start.elapsed().as_secs_f64());
                    return Some(value);
                }
            }
        }

        debug!("GET {} miss", key);
        if let Some(region) = miss_region {
            self.stats.record_miss(region, self.clock.now());
            metrics::record_cache_op(region.as_str(), "get", "miss");
        }
        metrics::observe_duration("get", start.elapsed().as_secs_f64());
        None
    }

    async fn read_level<T: DeserializeOwned>(
        &self,
        backend: &BackendHandle,
        region: Region,
        level: CacheLevel,
        key: &str,
    ) -> Option<T> {
        let storage_key = level.storage_key(key);
        let raw = match backend.get(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("GET {} failed in {}: {}", storage_key, region, e);
                metrics::record_cache_op(region.as_str(), "get", "error");
                return None;
            }
        };

        let now = self.clock.now();
        let mut entry = match CacheEntry::from_bytes(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Corrupt entry {} in {}: {}", storage_key, region, e);
                self.evict(backend, region, &storage_key, "corrupt").await;
                return None;
            }
        };

        if entry.is_expired(now) {
            debug!("Entry {} in {} expired", storage_key, region);
            self.evict(backend, region, &storage_key, "expired").await;
            return None;
        }

        let serialized = match self.decode_value(&entry) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!("Rejecting entry {} in {}: {}", storage_key, region, e);
                self.evict(backend, region, &storage_key, "corrupt").await;
                return None;
            }
        };

        let value = match serde_json::from_slice(&serialized) {
            Ok(value) => value,
            Err(e) => {
                // The stored data is intact; the caller asked for the wrong type
                warn!(
                    "Entry {} in {} does not decode as the requested type: {}",
                    storage_key, region, e
                );
                return None;
            }
        };

        entry.touch(now);
        self.write_back(backend, &storage_key, &raw, &entry).await;
        Some(value)
    }

    /// Persist access bookkeeping without extending the entry's lifetime.
    ///
    /// Skipped when the stored bytes are no longer `read`, so a concurrent
    /// write or delete always wins over the access update.
    async fn write_back(
        &self,
        backend: &BackendHandle,
        storage_key: &str,
        read: &[u8],
        entry: &CacheEntry,
    ) {
        let ttl = entry.remaining_ttl_secs(self.clock.now());
        if ttl == 0 {
            return;
        }
        let bytes = match entry.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not encode access update for {}: {}", storage_key, e);
                return;
            }
        };
        match backend.replace_if_unchanged(storage_key, read, ttl, bytes).await {
            Ok(true) => {}
            Ok(false) => debug!("Access update for {} dropped: entry changed", storage_key),
            Err(e) => debug!("Access update for {} not stored: {}", storage_key, e),
        }
    }

    async fn evict(&self, backend: &BackendHandle, region: Region, storage_key: &str, reason: &str) {
        match backend.delete(&[storage_key.to_string()]).await {
            Ok(removed) => {
                self.stats.record_evicted(region, removed, self.clock.now());
                metrics::record_evictions(region.as_str(), reason, removed);
            }
            Err(e) => warn!("Failed to evict {} in {}: {}", storage_key, region, e),
        }
    }

    /// Store a value at every level of a policy.
    ///
    /// The target region is the one `ip_address` resolves to, otherwise
    /// `region`. Fails with `PartialWrite` naming the levels that were not
    /// stored when any level fails.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        policy_id: &str,
        region: Region,
        ip_address: Option<&str>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        let start = Instant::now();
        let policies = self.policies();
        let policy = policies.get(policy_id).inspect_err(|e| {
            warn!("SET {} rejected: {}", key, e);
        })?;

        let client_region = ip_address.map(|ip| self.resolver.resolve(ip));
        let target = client_region.unwrap_or(region);

        if let Some(restriction) = policy.check_geo(region, client_region) {
            info!(
                "SET {} declined in {}: policy '{}' requires {}",
                key, target, policy.policy_id, restriction
            );
            metrics::record_cache_op(target.as_str(), "set", "declined");
            return Err(CacheError::GeoRestricted {
                region: target,
                restriction: restriction.to_string(),
            });
        }

        let Some(backend) = self.pool.get_backend(target) else {
            warn!("SET {} in unavailable region {}", key, target);
            metrics::record_cache_op(target.as_str(), "set", "unavailable");
            return Err(CacheError::RegionUnavailable(target));
        };

        let logical_key = match headers {
            Some(headers) => vary_suffixed(key, policy, headers),
            None => key.to_string(),
        };

        let serialized = serde_json::to_string(value)?;
        let digest = checksum(serialized.as_bytes());
        let size_bytes = serialized.len();
        let (stored, compression, cipher) = self.encode_value(serialized, policy)?;

        let now = self.clock.now();
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for level in &policy.cache_levels {
            let level = *level;
            let (Some(ttl), Some(max_size)) = (policy.ttl_secs(level), policy.max_size_bytes(level))
            else {
                failed.push(level);
                continue;
            };

            let entry = CacheEntry {
                key: logical_key.clone(),
                value: stored.clone(),
                content_type: policy.content_type.clone(),
                created_at: now,
                expires_at: now + Duration::seconds(ttl as i64),
                access_count: 0,
                last_accessed: now,
                size_bytes,
                cache_level: level,
                region: target,
                checksum: digest.clone(),
                compression,
                cipher: cipher.clone(),
            };
            let bytes = match entry.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("SET {} not encoded at {}: {}", logical_key, level, e);
                    failed.push(level);
                    continue;
                }
            };
            if bytes.len() > max_size {
                warn!(
                    "SET {} skipped at {}: {} bytes exceeds the {} byte limit",
                    logical_key,
                    level,
                    bytes.len(),
                    max_size
                );
                failed.push(level);
                continue;
            }

            let stored_len = bytes.len();
            let storage_key = level.storage_key(&logical_key);
            match backend.setex(&storage_key, ttl, bytes).await {
                Ok(()) => {
                    self.stats.record_set(target, stored_len, now);
                    succeeded.push(level);
                }
                Err(e) => {
                    warn!("SET {} failed in {}: {}", storage_key, target, e);
                    failed.push(level);
                }
            }
        }

        metrics::observe_duration("set", start.elapsed().as_secs_f64());
        if failed.is_empty() {
            debug!(
                "SET {} stored at {} level(s) in {}",
                logical_key,
                succeeded.len(),
                target
            );
            metrics::record_cache_op(target.as_str(), "set", "ok");
            Ok(())
        } else {
            metrics::record_cache_op(target.as_str(), "set", "error");
            Err(CacheError::PartialWrite { succeeded, failed })
        }
    }

    /// Apply the policy transforms: compress, then encrypt
    fn encode_value(
        &self,
        serialized: String,
        policy: &CachePolicy,
    ) -> Result<(String, CompressionAlgorithm, String)> {
        if !policy.compression_enabled && !policy.encryption_enabled {
            return Ok((serialized, CompressionAlgorithm::None, NO_CIPHER.to_string()));
        }

        let (mut bytes, compression) = if policy.compression_enabled {
            self.compressor.compress(serialized.as_bytes())?
        } else {
            (serialized.as_bytes().to_vec(), CompressionAlgorithm::None)
        };

        let cipher = if policy.encryption_enabled {
            bytes = self.cipher.encrypt(&bytes)?;
            self.cipher.name().to_string()
        } else {
            NO_CIPHER.to_string()
        };

        if compression == CompressionAlgorithm::None && cipher == NO_CIPHER {
            // Payload below the compression threshold
            return Ok((serialized, compression, cipher));
        }
        Ok((BASE64.encode(bytes), compression, cipher))
    }

    /// Undo the transforms and verify the checksum
    fn decode_value(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        let plain = if entry.is_transformed() {
            let mut bytes = BASE64
                .decode(entry.value.as_bytes())
                .map_err(|e| CacheError::Transform(format!("invalid base64 payload: {}", e)))?;
            if entry.cipher != NO_CIPHER {
                if entry.cipher != self.cipher.name() {
                    return Err(CacheError::Transform(format!(
                        "entry encrypted with '{}', engine uses '{}'",
                        entry.cipher,
                        self.cipher.name()
                    )));
                }
                bytes = self.cipher.decrypt(&bytes)?;
            }
            self.compressor.decompress(&bytes, entry.compression)?
        } else {
            entry.value.as_bytes().to_vec()
        };

        if checksum(&plain) != entry.checksum {
            return Err(CacheError::Transform("checksum mismatch".to_string()));
        }
        Ok(plain)
    }

    /// Key `set` uses for a policy with `vary_headers`, given request headers
    pub fn vary_key(
        &self,
        key: &str,
        policy_id: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String> {
        let policies = self.policies();
        let policy = policies.get(policy_id)?;
        Ok(vary_suffixed(key, policy, headers))
    }

    /// Remove a key, and every header variant `set` stored for it, from
    /// every level of the targeted regions.
    ///
    /// Returns true if any physical entry was removed.
    pub async fn delete(&self, key: &str, region: Option<Region>) -> bool {
        let start = Instant::now();
        let variants = format!("{}#vary:*", escape_glob(key));

        let mut removed_any = false;
        for region in self.target_regions(region, "delete") {
            let Some(backend) = self.pool.get_backend(region) else {
                continue;
            };

            let mut storage_keys = Vec::new();
            for level in CacheLevel::ALL {
                storage_keys.push(level.storage_key(key));
                let pattern = level.storage_key(&variants);
                match backend.keys(&pattern).await {
                    Ok(keys) => storage_keys.extend(keys),
                    Err(e) => warn!("KEYS {} failed in {}: {}", pattern, region, e),
                }
            }

            match backend.delete(&storage_keys).await {
                Ok(removed) => {
                    debug!("DEL {} removed {} entries in {}", key, removed, region);
                    self.stats.record_removed(region, removed, self.clock.now());
                    metrics::record_cache_op(region.as_str(), "delete", "ok");
                    removed_any |= removed > 0;
                }
                Err(e) => {
                    warn!("DEL {} failed in {}: {}", key, region, e);
                    metrics::record_cache_op(region.as_str(), "delete", "error");
                }
            }
        }

        metrics::observe_duration("delete", start.elapsed().as_secs_f64());
        removed_any
    }

    /// Remove every logical key matching a glob pattern, at every level.
    ///
    /// Returns how many physical entries were removed.
    pub async fn invalidate_pattern(&self, pattern: &str, region: Option<Region>) -> u64 {
        let start = Instant::now();
        let mut total = 0;

        for region in self.target_regions(region, "invalidate") {
            let Some(backend) = self.pool.get_backend(region) else {
                continue;
            };
            let mut removed_here = 0;
            for level in CacheLevel::ALL {
                let physical_pattern = level.storage_key(pattern);
                let keys = match backend.keys(&physical_pattern).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!("KEYS {} failed in {}: {}", physical_pattern, region, e);
                        continue;
                    }
                };
                if keys.is_empty() {
                    continue;
                }
                match backend.delete(&keys).await {
                    Ok(removed) => removed_here += removed,
                    Err(e) => warn!("Invalidation of {} failed in {}: {}", physical_pattern, region, e),
                }
            }

            if removed_here > 0 {
                info!("Invalidated {} entries matching '{}' in {}", removed_here, pattern, region);
                self.stats.record_removed(region, removed_here, self.clock.now());
                metrics::record_evictions(region.as_str(), "invalidated", removed_here);
            }
            total += removed_here;
        }

        metrics::observe_duration("invalidate", start.elapsed().as_secs_f64());
        total
    }

    /// Drop expired entries and report tuning recommendations.
    ///
    /// Without a region every connected region is scanned and failures are
    /// reported as recommendations; a named region must be available.
    pub async fn optimize(&self, region: Option<Region>) -> Result<OptimizationReport> {
        let start = Instant::now();
        let mut report = OptimizationReport::default();

        match region {
            Some(region) => {
                let backend = self
                    .pool
                    .get_backend(region)
                    .ok_or(CacheError::RegionUnavailable(region))?;
                let result = self.optimize_region(&backend, region).await?;
                report.add(result);
            }
            None => {
                for region in self.pool.regions() {
                    let Some(backend) = self.pool.get_backend(region) else {
                        continue;
                    };
                    match self.optimize_region(&backend, region).await {
                        Ok(result) => report.add(result),
                        Err(e) => {
                            warn!("Optimization of {} failed: {}", region, e);
                            report
                                .recommendations
                                .push(format!("Region {} could not be scanned: {}", region, e));
                        }
                    }
                }
            }
        }

        info!(
            "Optimization removed {} expired entries, {} recommendation(s)",
            report.entries_removed,
            report.recommendations.len()
        );
        metrics::observe_duration("optimize", start.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn optimize_region(
        &self,
        backend: &BackendHandle,
        region: Region,
    ) -> Result<(RegionOptimization, Vec<String>)> {
        let keys = backend.keys("*").await?;

        let mut expired = Vec::new();
        let mut near_expiry = 0;
        for key in &keys {
            match backend.ttl(key).await {
                Ok(TTL_MISSING) => expired.push(key.clone()),
                Ok(ttl) if (0..=NEAR_EXPIRY_WINDOW_SECS).contains(&ttl) => near_expiry += 1,
                Ok(_) => {}
                Err(e) => debug!("TTL {} failed in {}: {}", key, region, e),
            }
        }

        // DEL only counts live keys, so the reclaimed expired ones are counted here
        let expired_removed = expired.len() as u64;
        if !expired.is_empty() {
            backend.delete(&expired).await?;
            let now = self.clock.now();
            self.stats.record_evicted(region, expired_removed, now);
            metrics::record_evictions(region.as_str(), "expired", expired_removed);
        }

        let stats = self.stats.snapshot(region, self.clock.now());
        let lookups = stats.counters.hits + stats.counters.misses;

        let mut recommendations = Vec::new();
        if lookups > 0 && stats.hit_rate < HIT_RATE_THRESHOLD {
            recommendations.push(format!(
                "Region {}: hit rate {:.1}% is below {:.0}%; consider longer TTLs or warming hot keys",
                region,
                stats.hit_rate * 100.0,
                HIT_RATE_THRESHOLD * 100.0
            ));
        }
        if near_expiry > NEAR_EXPIRY_THRESHOLD {
            recommendations.push(format!(
                "Region {}: {} entries expire within {} seconds; consider prefetching",
                region, near_expiry, NEAR_EXPIRY_WINDOW_SECS
            ));
        }

        debug!(
            "Optimized {}: scanned {}, removed {}, {} near expiry",
            region,
            keys.len(),
            expired_removed,
            near_expiry
        );

        Ok((
            RegionOptimization {
                region,
                keys_scanned: keys.len() as u64,
                expired_removed,
                near_expiry,
                hit_rate: stats.hit_rate,
            },
            recommendations,
        ))
    }

    /// Counters for one region, or for every connected region
    pub fn get_stats(&self, region: Option<Region>) -> BTreeMap<Region, RegionStats> {
        let now = self.clock.now();
        let regions = match region {
            Some(region) => vec![region],
            None => self.pool.regions(),
        };
        regions
            .into_iter()
            .map(|region| (region, self.stats.snapshot(region, now)))
            .collect()
    }

    /// Flush a region's backend and zero its counters.
    ///
    /// Returns false if the region is unavailable or the flush failed.
    pub async fn clear_region(&self, region: Region) -> bool {
        let flushed = match self.pool.get_backend(region) {
            Some(backend) => match backend.flushdb().await {
                Ok(()) => {
                    info!("Cleared cache region {}", region);
                    true
                }
                Err(e) => {
                    warn!("Failed to clear region {}: {}", region, e);
                    false
                }
            },
            None => {
                warn!("Cannot clear unavailable region {}", region);
                false
            }
        };

        self.stats.reset(region, self.clock.now());
        flushed
    }

    /// Release every backend connection
    pub async fn close(&self) {
        info!("Closing Geotier cache");
        self.pool.close_all().await;
    }

    fn target_regions(&self, region: Option<Region>, operation: &str) -> Vec<Region> {
        match region {
            Some(region) => {
                if !self.pool.is_connected(region) {
                    warn!("{} in unavailable region {}", operation, region);
                    metrics::record_cache_op(region.as_str(), operation, "unavailable");
                }
                vec![region]
            }
            None => self.pool.regions(),
        }
    }
}

impl OptimizationReport {
    fn add(&mut self, (region, recommendations): (RegionOptimization, Vec<String>)) {
        self.entries_removed += region.expired_removed;
        self.recommendations.extend(recommendations);
        self.regions.push(region);
    }
}

/// Append a digest of the policy's vary headers; unchanged when none are present
fn vary_suffixed(key: &str, policy: &CachePolicy, headers: &HashMap<String, String>) -> String {
    if policy.vary_headers.is_empty() {
        return key.to_string();
    }

    let values: Vec<(String, &str)> = policy
        .vary_headers
        .iter()
        .map(|name| {
            let value = headers
                .iter()
                .find(|(header, _)| header.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.trim())
                .unwrap_or("");
            (name.to_ascii_lowercase(), value)
        })
        .collect();

    if values.iter().all(|(_, value)| value.is_empty()) {
        return key.to_string();
    }

    let canonical = values
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}#vary:{}", key, &checksum(canonical.as_bytes())[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::backend::MemoryBackendConfig;
    use crate::core::clock::ManualClock;
    use crate::crypto::IdentityCipher;
    use crate::policy::default_policies;
    use serde_json::json;

    fn engine_with(regions: &[Region]) -> (MultiTierCache, ManualClock) {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let mut builder = MultiTierCache::builder(
            PolicyStore::from_policies(default_policies()).unwrap(),
        )
        .clock(shared.clone())
        .cipher(Arc::new(IdentityCipher));
        for region in regions {
            builder = builder.backend(
                *region,
                Arc::new(MemoryBackend::with_clock(
                    MemoryBackendConfig::default(),
                    shared.clone(),
                )),
            );
        }
        (builder.build(), clock)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (cache, _) = engine_with(&[Region::Europe]);
        let value = json!({"items": [1, 2, 3], "page": 1});

        cache
            .set("catalog:1", &value, "api_responses", Region::Europe, None, None)
            .await
            .unwrap();

        let found: Option<serde_json::Value> = cache.get("catalog:1", Some(Region::Europe), None).await;
        assert_eq!(found, Some(value));
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let (cache, _) = engine_with(&[Region::Europe]);

        let result = cache
            .set("k", &1, "nonexistent", Region::Europe, None, None)
            .await;
        assert!(matches!(result, Err(CacheError::PolicyNotFound(_))));
        assert_eq!(cache.get::<i32>("k", Some(Region::Europe), None).await, None);
    }

    #[tokio::test]
    async fn test_set_in_unavailable_region() {
        let (cache, _) = engine_with(&[Region::Europe]);

        let result = cache
            .set("k", &1, "api_responses", Region::Africa, None, None)
            .await;
        assert!(matches!(
            result,
            Err(CacheError::RegionUnavailable(Region::Africa))
        ));
        assert_eq!(cache.get::<i32>("k", Some(Region::Africa), None).await, None);
    }

    #[tokio::test]
    async fn test_access_count_written_back() {
        let (cache, _) = engine_with(&[Region::Americas]);
        cache
            .set("k", "v", "api_responses", Region::Americas, None, None)
            .await
            .unwrap();

        for _ in 0..3 {
            let _: Option<String> = cache.get("k", Some(Region::Americas), None).await;
        }

        let backend = cache.pool().get_backend(Region::Americas).unwrap();
        let raw = backend.get("l1_edge:k").await.unwrap().unwrap();
        let entry = CacheEntry::from_bytes(&raw).unwrap();
        assert_eq!(entry.access_count, 3);
        assert!(backend.ttl("l1_edge:k").await.unwrap() <= 300);
    }

    #[tokio::test]
    async fn test_miss_counts_against_first_candidate() {
        let (cache, _) = engine_with(&[Region::Europe, Region::Americas]);

        let _: Option<String> = cache.get("absent", None, None).await;

        let stats = cache.get_stats(None);
        assert_eq!(stats[&Region::Americas].counters.misses, 1);
        assert_eq!(stats[&Region::Europe].counters.misses, 0);
    }

    #[tokio::test]
    async fn test_vary_key() {
        let (cache, _) = engine_with(&[Region::Europe]);
        let mut headers = HashMap::new();
        headers.insert("Accept-Language".to_string(), "de-DE".to_string());

        cache
            .set("page", "hallo", "api_responses", Region::Europe, None, Some(&headers))
            .await
            .unwrap();

        let key = cache.vary_key("page", "api_responses", &headers).unwrap();
        assert_ne!(key, "page");
        assert_eq!(
            cache.get::<String>(&key, Some(Region::Europe), None).await,
            Some("hallo".to_string())
        );
        assert_eq!(cache.get::<String>("page", Some(Region::Europe), None).await, None);

        // Policies without vary headers leave the key alone
        assert_eq!(cache.vary_key("page", "user_data", &headers).unwrap(), "page");
    }

    #[tokio::test]
    async fn test_reload_policies() {
        let (cache, _) = engine_with(&[Region::Europe]);
        let mut policies = default_policies();
        policies.remove("analytics");
        cache.reload_policies(PolicyStore::from_policies(policies).unwrap());

        let result = cache.set("k", &1, "analytics", Region::Europe, None, None).await;
        assert!(matches!(result, Err(CacheError::PolicyNotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_unavailable_region_resets_stats() {
        let (cache, _) = engine_with(&[Region::Europe]);
        let _: Option<i32> = cache.get("k", Some(Region::China), None).await;
        assert_eq!(cache.get_stats(Some(Region::China))[&Region::China].counters.misses, 1);

        assert!(!cache.clear_region(Region::China).await);
        assert_eq!(cache.get_stats(Some(Region::China))[&Region::China].counters.misses, 0);
    }

    #[tokio::test]
    async fn test_optimize_unavailable_region() {
        let (cache, _) = engine_with(&[Region::Europe]);

        assert!(matches!(
            cache.optimize(Some(Region::Africa)).await,
            Err(CacheError::RegionUnavailable(Region::Africa))
        ));
        assert!(cache.optimize(None).await.is_ok());
    }
}
