//! Wiring of the configured cache, fetcher and coordinator

use crate::cache::MasterImageCache;
use crate::config::{Config, ConfigManager};
use crate::error::ImageCacheResult;
use crate::fetch::StandardFetcher;
use crate::lock::LockService;
use crate::reclaim::CrossCacheCoordinator;
use std::sync::Arc;
use tracing::debug;

/// Everything a command needs to work with the configured cache
pub struct CacheContext {
    pub coordinator: Arc<CrossCacheCoordinator>,
    pub fetcher: Arc<StandardFetcher>,
    pub cache: Arc<MasterImageCache>,
}

impl CacheContext {
    /// Build the cache from `config` and register it for disk-space reclamation
    pub fn open(config: &Config) -> ImageCacheResult<Self> {
        let coordinator = Arc::new(CrossCacheCoordinator::default());
        let fetcher = Arc::new(
            StandardFetcher::new(&config.fetch).with_coordinator(Arc::clone(&coordinator)),
        );

        let lock_dir = ConfigManager::lock_dir(config);
        debug!("Using lock directory {}", lock_dir.display());
        let locks = LockService::new(lock_dir)?;

        let cache = Arc::new(MasterImageCache::new(
            config.cache_settings(),
            locks,
            fetcher.clone(),
        )?);

        let registered = Arc::clone(&cache);
        coordinator.register_for_cleanup(config.cache.cleanup_priority, move || {
            Arc::clone(&registered)
        })?;

        Ok(Self {
            coordinator,
            fetcher,
            cache,
        })
    }
}
