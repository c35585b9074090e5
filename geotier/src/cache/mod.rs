//! Cache Module
//!
//! - Engine: region routing, per-level reads and writes, maintenance
//! - Stats: per-region counters

pub mod engine;
pub mod stats;

pub use engine::{CacheBuilder, MultiTierCache, OptimizationReport, RegionOptimization};
pub use stats::{CacheStats, RegionStats, StatsRegistry};
