use super::types::{CacheLevel, Region};
use thiserror::Error;

/// Main error type for Geotier cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Region unavailable: {0}")]
    RegionUnavailable(Region),

    #[error("Write declined in region {region}: geo-restriction '{restriction}' not satisfied")]
    GeoRestricted { region: Region, restriction: String },

    #[error("Partial write - succeeded: {succeeded:?}, failed: {failed:?}")]
    PartialWrite {
        succeeded: Vec<CacheLevel>,
        failed: Vec<CacheLevel>,
    },

    #[error("Backend I/O error: {0}")]
    BackendIo(String),

    #[error("Memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Whether the failure came from talking to a backend (as opposed to caller input)
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::BackendIo(_) | Self::RegionUnavailable(_) | Self::MemoryLimitExceeded
        )
    }

    /// Whether the caller asked for something the engine deliberately refused
    pub fn is_declined(&self) -> bool {
        matches!(self, Self::GeoRestricted { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for Geotier operations
pub type Result<T> = std::result::Result<T, CacheError>;
