//! Image fetching boundary
//!
//! The cache never reads image bytes itself. Everything that touches image
//! content (transport, format inspection, raw conversion) goes through the
//! [`Fetcher`] trait, so the cache can run against any image service.

pub mod convert;
pub mod http;

pub use convert::{ImageInfo, QemuImg};
pub use http::StandardFetcher;

use crate::cache::ImageRef;
use crate::error::ImageCacheResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Retrieves and converts images on behalf of the cache
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `image` to `dest`, converting it to raw format when `force_raw`
    async fn fetch(&self, image: &ImageRef, dest: &Path, force_raw: bool) -> ImageCacheResult<()>;

    /// Whether the downloaded file at `path` is not raw yet and would be converted
    async fn will_convert_to_raw(&self, image: &ImageRef, path: &Path) -> ImageCacheResult<bool>;

    /// Estimated size of `path` once converted to raw
    async fn estimate_converted_size(&self, path: &Path) -> ImageCacheResult<u64>;

    /// Size of the image as reported by its source
    async fn query_remote_size(&self, image: &ImageRef) -> ImageCacheResult<u64>;

    /// Convert the downloaded file at `src` to raw format at `dest`
    async fn convert_to_raw(&self, image: &ImageRef, dest: &Path, src: &Path)
        -> ImageCacheResult<()>;

    /// Last modification time reported by the source, if it reports one
    async fn upstream_modified(&self, image: &ImageRef) -> ImageCacheResult<Option<DateTime<Utc>>>;
}

/// Temporary download path next to `dest`
pub(crate) fn part_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    name.into()
}
