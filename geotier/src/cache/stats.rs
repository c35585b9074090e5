//! Per-region cache counters

use crate::core::types::Region;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters for one region, reset only by `clear_region`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Approximate bytes held across all levels
    pub size_bytes: u64,
    /// Approximate physical entries across all levels
    pub entry_count: u64,
    pub last_reset: DateTime<Utc>,
}

impl CacheStats {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            hits: 0,
            misses: 0,
            sets: 0,
            deletes: 0,
            size_bytes: 0,
            entry_count: 0,
            last_reset: now,
        }
    }

    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn forget(&mut self, count: u64) {
        // Sizes of removed entries are unknown; assume they were average
        let average = self.size_bytes.checked_div(self.entry_count).unwrap_or(0);
        self.entry_count = self.entry_count.saturating_sub(count);
        self.size_bytes = self.size_bytes.saturating_sub(average * count);
    }
}

/// Snapshot returned by `get_stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionStats {
    #[serde(flatten)]
    pub counters: CacheStats,
    pub hit_rate: f64,
}

/// Stats bookkeeping keyed by region
#[derive(Debug, Default)]
pub struct StatsRegistry {
    regions: Mutex<BTreeMap<Region, CacheStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, region: Region, now: DateTime<Utc>, f: impl FnOnce(&mut CacheStats)) {
        let mut regions = self.regions.lock();
        f(regions.entry(region).or_insert_with(|| CacheStats::new(now)));
    }

    pub fn record_hit(&self, region: Region, now: DateTime<Utc>) {
        self.update(region, now, |s| s.hits += 1);
    }

    pub fn record_miss(&self, region: Region, now: DateTime<Utc>) {
        self.update(region, now, |s| s.misses += 1);
    }

    pub fn record_set(&self, region: Region, size_bytes: usize, now: DateTime<Utc>) {
        self.update(region, now, |s| {
            s.sets += 1;
            s.entry_count += 1;
            s.size_bytes += size_bytes as u64;
        });
    }

    /// Entries removed by `delete` or pattern invalidation
    pub fn record_removed(&self, region: Region, count: u64, now: DateTime<Utc>) {
        if count > 0 {
            self.update(region, now, |s| {
                s.deletes += count;
                s.forget(count);
            });
        }
    }

    /// Entries dropped because they expired or failed verification
    pub fn record_evicted(&self, region: Region, count: u64, now: DateTime<Utc>) {
        if count > 0 {
            self.update(region, now, |s| s.forget(count));
        }
    }

    /// Zero a region's counters
    pub fn reset(&self, region: Region, now: DateTime<Utc>) {
        self.regions.lock().insert(region, CacheStats::new(now));
    }

    pub fn snapshot(&self, region: Region, now: DateTime<Utc>) -> RegionStats {
        let counters = self
            .regions
            .lock()
            .get(&region)
            .cloned()
            .unwrap_or_else(|| CacheStats::new(now));
        RegionStats {
            hit_rate: counters.hit_rate(),
            counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let registry = StatsRegistry::new();
        let now = Utc::now();

        assert_eq!(registry.snapshot(Region::Europe, now).hit_rate, 0.0);

        registry.record_hit(Region::Europe, now);
        registry.record_hit(Region::Europe, now);
        registry.record_hit(Region::Europe, now);
        registry.record_miss(Region::Europe, now);

        let stats = registry.snapshot(Region::Europe, now);
        assert_eq!(stats.counters.hits, 3);
        assert_eq!(stats.counters.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_removal_is_approximate_but_bounded() {
        let registry = StatsRegistry::new();
        let now = Utc::now();

        registry.record_set(Region::Africa, 100, now);
        registry.record_set(Region::Africa, 300, now);
        registry.record_removed(Region::Africa, 1, now);

        let stats = registry.snapshot(Region::Africa, now).counters;
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.size_bytes, 200);

        registry.record_evicted(Region::Africa, 5, now);
        let stats = registry.snapshot(Region::Africa, now).counters;
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.size_bytes, 0);
    }

    #[test]
    fn test_reset() {
        let registry = StatsRegistry::new();
        let before = Utc::now();
        registry.record_set(Region::China, 10, before);

        let later = before + chrono::Duration::seconds(60);
        registry.reset(Region::China, later);

        let stats = registry.snapshot(Region::China, later).counters;
        assert_eq!(stats, CacheStats::new(later));
    }
}
