pub mod backend;
pub mod cache;
pub mod compression;
pub mod config;
pub mod core;
pub mod crypto;
pub mod metrics;
pub mod policy;
pub mod region;

// Re-export commonly used types
pub use backend::{
    BackendConnector, BackendHandle, CacheBackend, DefaultConnector, MemoryBackend,
    RegionBackendPool,
};
pub use cache::{CacheBuilder, CacheStats, MultiTierCache, OptimizationReport, RegionStats};
pub use compression::{CompressionAlgorithm, CompressionConfig, Compressor};
pub use config::{CacheConfig, ConfigSource, RegionBackendConfig};
pub use core::{
    CacheEntry, CacheError, CacheLevel, Clock, ManualClock, Region, Result, SharedClock,
    SystemClock,
};
pub use crypto::{AesGcmCipher, Cipher, IdentityCipher};
pub use policy::{CachePolicy, GeoRestriction, PolicyStore};
pub use region::RegionResolver;
