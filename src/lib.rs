//! imagecache - master image cache for bare-metal provisioning
//!
//! Keeps one copy of each deploy image in a master directory and hands it
//! out to destinations as hard links, evicting unreferenced masters by age
//! and by total size.

pub mod cache;
pub mod cli;
pub mod config;
pub mod disk;
pub mod error;
pub mod fetch;
pub mod lock;
pub mod reclaim;

pub use cache::{ImageRef, MasterImageCache};
pub use error::{ImageCacheError, ImageCacheResult};
pub use reclaim::{fetch_images, CrossCacheCoordinator};
