use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::compression::CompressionConfig;
use crate::core::error::{CacheError, Result};
use crate::core::types::Region;
use crate::crypto::EncryptionConfig;
use crate::policy::{CachePolicy, default_policies};
use crate::region::{GeoRangeConfig, default_geo_ranges};

/// Where configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in defaults, no filesystem access
    Defaults,
    /// JSON (or YAML by extension) file, created with defaults when absent
    File(PathBuf),
}

/// Which backend implementation serves a region
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store
    #[default]
    Memory,
    /// Redis server (requires the `redis` feature)
    Redis,
}

/// Connection settings for one region's backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegionBackendConfig {
    pub backend: BackendKind,
    pub host: String,
    pub port: u16,
    pub db: u32,
    /// Maximum concurrent connections/operations
    pub max_connections: usize,
    /// Memory ceiling in MB
    pub max_memory: usize,
}

impl Default for RegionBackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            max_connections: 50,
            max_memory: 256,
        }
    }
}

impl RegionBackendConfig {
    /// Connection URL for networked backends
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(CacheError::Configuration(
                "max_connections must be positive".to_string(),
            ));
        }
        if self.max_memory == 0 {
            return Err(CacheError::Configuration(
                "max_memory must be positive".to_string(),
            ));
        }
        if self.backend == BackendKind::Redis && self.host.is_empty() {
            return Err(CacheError::Configuration(
                "redis backend requires a host".to_string(),
            ));
        }
        Ok(())
    }
}

/// Background maintenance settings used by the binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between `optimize` runs (0 disables)
    pub optimize_interval_secs: u64,
    /// Interval between in-process TTL sweeps (0 disables)
    pub ttl_sweep_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            optimize_interval_secs: 300,
            ttl_sweep_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Main cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub regions: BTreeMap<Region, RegionBackendConfig>,
    pub policies: BTreeMap<String, CachePolicy>,
    /// Region used when an address matches no range
    pub default_region: Region,
    /// Lookup order for reads that do not name a region
    pub region_priority: Vec<Region>,
    /// Ordered address ranges per region, first match wins
    pub geo_ranges: Vec<GeoRangeConfig>,
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
    pub maintenance: MaintenanceConfig,
    pub logging: LoggingConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            regions: Region::ALL
                .into_iter()
                .map(|region| (region, RegionBackendConfig::default()))
                .collect(),
            policies: default_policies(),
            default_region: Region::Americas,
            region_priority: vec![
                Region::Americas,
                Region::Europe,
                Region::AsiaPacific,
                Region::MiddleEast,
                Region::Africa,
                Region::China,
            ],
            geo_ranges: default_geo_ranges(),
            compression: CompressionConfig::default(),
            encryption: EncryptionConfig::default(),
            maintenance: MaintenanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Resolve a configuration source
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        match source {
            ConfigSource::Defaults => Ok(Self::default()),
            ConfigSource::File(path) => Self::load_or_init(path),
        }
    }

    /// Load configuration from a JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(&content, is_yaml(path))
            .map_err(|e| CacheError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration, first writing the defaults if the file does not exist
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(
                "Configuration {} not found, writing defaults",
                path.display()
            );
            Self::default().save(path)?;
        }
        Self::from_file(path)
    }

    /// Write configuration to a file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let content = if is_yaml(path) {
            serde_yaml::to_string(self).map_err(|e| CacheError::Serialization(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self)?
        };
        fs::write(path, content)?;
        Ok(())
    }

    /// Parse configuration text
    pub fn parse(content: &str, yaml: bool) -> std::result::Result<Self, String> {
        if yaml {
            serde_yaml::from_str(content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(content).map_err(|e| e.to_string())
        }
    }

    /// Regions to try, in order, for reads that do not name one
    pub fn lookup_order(&self) -> Vec<Region> {
        let mut order = Vec::with_capacity(Region::ALL.len());
        for region in self
            .region_priority
            .iter()
            .copied()
            .chain(std::iter::once(self.default_region))
            .chain(Region::ALL)
        {
            if !order.contains(&region) {
                order.push(region);
            }
        }
        order
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}
