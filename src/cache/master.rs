//! The master image cache
//!
//! Each image is stored once under the master directory and hard-linked into
//! every destination that asks for it. The hard-link count doubles as the
//! reference count shared by all processes on the host: a master with more
//! than one link is in use and is never evicted.
//!
//! Two named locks keep concurrent callers consistent:
//! - `download-image:<key>` (or a single `download-image` lock when parallel
//!   downloads are disabled) serialises populating one key;
//! - `master_image` serialises linking an existing master out against the
//!   whole clean-up sweep.

use super::eviction::{self, EvictionPolicy, MasterEntry};
use super::key::ImageRef;
use crate::config::CacheSettings;
use crate::error::{ImageCacheError, ImageCacheResult};
use crate::fetch::Fetcher;
use crate::lock::{download_lock_name, LockService, DOWNLOAD_LOCK, MASTER_LOCK};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Disk-resident, hard-link based cache of master images
pub struct MasterImageCache {
    settings: CacheSettings,
    locks: LockService,
    fetcher: Arc<dyn Fetcher>,
}

impl MasterImageCache {
    /// Create a cache, creating the master directory when caching is enabled
    pub fn new(
        settings: CacheSettings,
        locks: LockService,
        fetcher: Arc<dyn Fetcher>,
    ) -> ImageCacheResult<Self> {
        if let Some(dir) = &settings.master_dir {
            fs::create_dir_all(dir).map_err(|e| {
                ImageCacheError::io(format!("creating master directory {}", dir.display()), e)
            })?;
        }

        Ok(Self {
            settings,
            locks,
            fetcher,
        })
    }

    /// Master directory, or `None` when caching is disabled
    pub fn master_dir(&self) -> Option<&Path> {
        self.settings.master_dir.as_deref()
    }

    pub fn cache_size_bytes(&self) -> u64 {
        self.settings.cache_size_bytes
    }

    pub fn cache_ttl(&self) -> Duration {
        self.settings.cache_ttl
    }

    /// Path of the master entry for `image`
    pub fn master_path(&self, image: &ImageRef, force_raw: bool) -> Option<PathBuf> {
        self.master_dir()
            .map(|dir| dir.join(image.master_file_name(force_raw)))
    }

    /// Fetch the image named by `reference` to `dest`
    pub async fn fetch_image(&self, reference: &str, dest: &Path, force_raw: bool) -> ImageCacheResult<()> {
        self.fetch(&ImageRef::parse(reference), dest, force_raw).await
    }

    /// Make `dest` a usable copy of `image`, downloading only on a cache miss.
    ///
    /// A successful download is followed by a best-effort clean-up whose
    /// failures are logged, never returned.
    pub async fn fetch(&self, image: &ImageRef, dest: &Path, force_raw: bool) -> ImageCacheResult<()> {
        let Some(master_dir) = self.master_dir() else {
            let _guard = if self.settings.parallel_downloads {
                None
            } else {
                Some(self.locks.lock(DOWNLOAD_LOCK).await?)
            };
            debug!("Caching disabled, fetching {} directly", image);
            return self.fetcher.fetch(image, dest, force_raw).await;
        };

        let master_name = image.master_file_name(force_raw);
        let master_path = master_dir.join(&master_name);
        let lock_name = if self.settings.parallel_downloads {
            download_lock_name(&master_name)
        } else {
            DOWNLOAD_LOCK.to_string()
        };

        {
            let _guard = self.locks.lock(&lock_name).await?;

            let master_valid = self.master_is_current(image, &master_path).await?;
            let dest_valid = dest_is_current(&master_path, dest)?;

            if master_valid && dest_valid {
                debug!("{} already up to date at {}", image, dest.display());
                return Ok(());
            }

            if master_valid {
                let _master = self.locks.lock(MASTER_LOCK).await?;
                // A sweep may have run between the check and taking the lock
                if master_path.exists() {
                    hard_link(image, &master_path, dest)?;
                    info!("Linked cached master {} to {}", master_name, dest.display());
                    return Ok(());
                }
                debug!("Master {} vanished before link-out", master_name);
            }

            self.download_image(image, master_dir, &master_path, dest, force_raw)
                .await?;
        }

        self.clean_up(None).await;
        Ok(())
    }

    /// Download into a private temporary directory, then link the result to
    /// the master path and on to `dest`.
    async fn download_image(
        &self,
        image: &ImageRef,
        master_dir: &Path,
        master_path: &Path,
        dest: &Path,
        force_raw: bool,
    ) -> ImageCacheResult<()> {
        let tmp_dir = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(master_dir)
            .map_err(|e| {
                ImageCacheError::io(
                    format!("creating temporary directory in {}", master_dir.display()),
                    e,
                )
            })?;

        let file_name = master_path
            .file_name()
            .ok_or_else(|| ImageCacheError::Internal("master path has no file name".into()))?;
        let tmp_path = tmp_dir.path().join(file_name);

        info!("Downloading {} into master image cache", image);
        self.fetcher.fetch(image, &tmp_path, force_raw).await?;

        hard_link(image, &tmp_path, master_path)?;
        hard_link(image, master_path, dest)?;
        info!("Cached {} as {}", image, master_path.display());

        if let Err(e) = tmp_dir.close() {
            warn!("Failed to remove temporary download directory: {}", e);
        }
        Ok(())
    }

    /// Whether the master for `image` exists and is not older than its source.
    /// A stale master is deleted.
    async fn master_is_current(&self, image: &ImageRef, master_path: &Path) -> ImageCacheResult<bool> {
        let metadata = match fs::metadata(master_path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(ImageCacheError::io(
                    format!("stat {}", master_path.display()),
                    e,
                ))
            }
        };

        // Registry images are immutable once published
        if image.is_registry() {
            return Ok(true);
        }

        let upstream = match self.fetcher.upstream_modified(image).await? {
            Some(upstream) => upstream,
            None if self.settings.assume_fresh_without_timestamp => {
                warn!(
                    "Image service reports no modification time for {}, assuming cached master {} is up to date",
                    image,
                    master_path.display()
                );
                return Ok(true);
            }
            None => {
                info!("No modification time for {}, refreshing master", image);
                remove_file(master_path)?;
                return Ok(false);
            }
        };

        let master_mtime = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|e| ImageCacheError::io(format!("mtime of {}", master_path.display()), e))?;

        if upstream <= master_mtime {
            return Ok(true);
        }

        info!(
            "Master {} is older than its source ({} < {}), removing",
            master_path.display(),
            master_mtime,
            upstream
        );
        remove_file(master_path)?;
        Ok(false)
    }

    /// Run the two-stage eviction sweep. Returns the part of `amount` that
    /// could not be freed; failures are logged, never returned.
    pub async fn clean_up(&self, amount: Option<u64>) -> u64 {
        self.clean_up_at(SystemTime::now(), amount).await
    }

    /// [`clean_up`](Self::clean_up) with an explicit notion of "now"
    pub async fn clean_up_at(&self, now: SystemTime, amount: Option<u64>) -> u64 {
        let unmet = amount.unwrap_or(0);
        let Some(master_dir) = self.master_dir() else {
            return unmet;
        };

        let _guard = match self.locks.lock(MASTER_LOCK).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Skipping master image cache clean up: {}", e);
                return unmet;
            }
        };

        debug!("Cleaning up master image cache {}", master_dir.display());
        let policy = EvictionPolicy {
            cache_size_bytes: self.settings.cache_size_bytes,
            cache_ttl: self.settings.cache_ttl,
        };
        let dir = master_dir.to_path_buf();

        match tokio::task::spawn_blocking(move || eviction::sweep(&dir, &policy, now, amount)).await {
            Ok(Ok(left)) => {
                if left > 0 {
                    warn!(
                        "Cache clean up was unable to reclaim {} of disk space, still {} required",
                        eviction::format_bytes(unmet),
                        eviction::format_bytes(left)
                    );
                }
                left
            }
            Ok(Err(e)) => {
                warn!("Master image cache clean up failed: {}", e);
                unmet
            }
            Err(e) => {
                warn!("Master image cache clean up task failed: {}", e);
                unmet
            }
        }
    }

    /// All master entries, referenced or not
    pub fn entries(&self) -> ImageCacheResult<Vec<MasterEntry>> {
        match self.master_dir() {
            Some(dir) => eviction::list_entries(dir)
                .map_err(|e| ImageCacheError::io(format!("listing {}", dir.display()), e)),
            None => Ok(Vec::new()),
        }
    }

    /// Current size of the master directory
    pub fn total_size(&self) -> ImageCacheResult<u64> {
        match self.master_dir() {
            Some(dir) => eviction::directory_size(dir)
                .map_err(|e| ImageCacheError::io(format!("sizing {}", dir.display()), e)),
            None => Ok(0),
        }
    }
}

/// Whether `dest` exists and is the same inode as the master. A stale
/// destination is deleted.
fn dest_is_current(master_path: &Path, dest: &Path) -> ImageCacheResult<bool> {
    let dest_meta = match fs::metadata(dest) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(ImageCacheError::io(format!("stat {}", dest.display()), e)),
    };

    let same_inode = match fs::metadata(master_path) {
        Ok(master_meta) => master_meta.dev() == dest_meta.dev() && master_meta.ino() == dest_meta.ino(),
        Err(_) => false,
    };

    if !same_inode {
        debug!("Destination {} is stale, removing", dest.display());
        remove_file(dest)?;
    }
    Ok(same_inode)
}

fn hard_link(image: &ImageRef, from: &Path, to: &Path) -> ImageCacheResult<()> {
    fs::hard_link(from, to).map_err(|e| ImageCacheError::LinkFailed {
        image: image.to_string(),
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source: e,
    })
}

fn remove_file(path: &Path) -> ImageCacheResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ImageCacheError::io(format!("removing {}", path.display()), e)),
    }
}
