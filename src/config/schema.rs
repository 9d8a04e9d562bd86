//! Configuration schema for imagecache
//!
//! Configuration is stored at `~/.config/imagecache/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Master image cache settings
    pub cache: CacheConfig,

    /// Named lock settings
    pub locks: LockConfig,

    /// Image fetching settings
    pub fetch: FetchConfig,
}

impl Config {
    /// Typed settings for a `MasterImageCache` built from this configuration
    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            master_dir: self.cache.master_dir.clone(),
            cache_size_bytes: mb_to_bytes(self.cache.size_mb),
            cache_ttl: Duration::from_secs(self.cache.ttl_minutes.saturating_mul(60)),
            parallel_downloads: self.cache.parallel_downloads,
            assume_fresh_without_timestamp: self.fetch.assume_fresh_without_timestamp,
        }
    }
}

/// Convert MiB to bytes
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Master image cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding master images; caching is disabled when unset
    pub master_dir: Option<PathBuf>,

    /// Soft ceiling on the cache directory size in MiB
    pub size_mb: u64,

    /// Minutes after last use before an unreferenced master becomes evictable
    pub ttl_minutes: u64,

    /// Allow downloads of different images to run concurrently
    pub parallel_downloads: bool,

    /// Priority of this cache when other consumers demand disk space
    pub cleanup_priority: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            master_dir: None,
            size_mb: 20480,
            ttl_minutes: 10080,
            parallel_downloads: true,
            cleanup_priority: 50,
        }
    }
}

/// Named lock configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Directory for lock files (defaults to the state directory)
    pub dir: Option<PathBuf>,
}

/// Image fetching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Base URL of the image registry used for `glance://` and UUID references
    pub registry_url: Option<String>,

    /// Timeout for a single HTTP transfer in seconds
    pub http_timeout_secs: u64,

    /// qemu-img binary used for inspection and conversion
    pub qemu_img: String,

    /// Upper bound of raw size relative to on-disk size when estimating conversions
    pub raw_image_growth_factor: f64,

    /// Treat a cached master as current when the upstream reports no timestamp
    pub assume_fresh_without_timestamp: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            registry_url: None,
            http_timeout_secs: 300,
            qemu_img: "qemu-img".to_string(),
            raw_image_growth_factor: 2.0,
            assume_fresh_without_timestamp: true,
        }
    }
}

/// Settings consumed by `MasterImageCache`
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub master_dir: Option<PathBuf>,
    pub cache_size_bytes: u64,
    pub cache_ttl: Duration,
    pub parallel_downloads: bool,
    pub assume_fresh_without_timestamp: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Config::default().cache_settings()
    }
}
