use super::{BackendConnector, BackendHandle};
use crate::config::RegionBackendConfig;
use crate::core::types::Region;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// One backend per region.
///
/// Populated at startup; a region whose backend cannot be reached is left out
/// and every operation routed to it degrades to a miss.
#[derive(Default)]
pub struct RegionBackendPool {
    backends: RwLock<BTreeMap<Region, BackendHandle>>,
    closed: AtomicBool,
}

impl RegionBackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a region's backend and check it is alive.
    ///
    /// Returns whether the region joined the pool. Failures are logged, never fatal.
    pub async fn connect(
        &self,
        region: Region,
        config: &RegionBackendConfig,
        connector: &dyn BackendConnector,
    ) -> bool {
        let backend = match connector.connect(region, config).await {
            Ok(backend) => backend,
            Err(e) => {
                error!("Failed to connect cache backend for region {}: {}", region, e);
                return false;
            }
        };

        if let Err(e) = backend.ping().await {
            error!(
                "Cache backend for region {} failed health check, excluding it: {}",
                region, e
            );
            if let Err(e) = backend.close().await {
                warn!("Error closing unhealthy backend for {}: {}", region, e);
            }
            return false;
        }

        self.insert(region, backend);
        true
    }

    /// Add an already-connected backend
    pub fn insert(&self, region: Region, backend: BackendHandle) {
        info!("Region {} connected ({} backend)", region, backend.kind());
        self.backends.write().insert(region, backend);
    }

    /// Live backend for a region
    pub fn get_backend(&self, region: Region) -> Option<BackendHandle> {
        self.backends.read().get(&region).cloned()
    }

    /// Connected regions in region order
    pub fn regions(&self) -> Vec<Region> {
        self.backends.read().keys().copied().collect()
    }

    pub fn is_connected(&self, region: Region) -> bool {
        self.backends.read().contains_key(&region)
    }

    /// Release every connection. Safe to call more than once.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let backends: Vec<(Region, BackendHandle)> =
            std::mem::take(&mut *self.backends.write()).into_iter().collect();

        for (region, backend) in backends {
            match backend.close().await {
                Ok(()) => info!("Closed cache backend for region {}", region),
                Err(e) => warn!("Error closing cache backend for region {}: {}", region, e),
            }
        }
    }
}
