//! Host-wide named locks
//!
//! Each lock name maps to a file under the lock directory; holding the lock
//! means holding an exclusive `flock(2)` on that file. Locks exclude other
//! tasks in this process as well as other processes on the host, and are
//! released when the [`LockGuard`] is dropped.
//!
//! Lock files are left in place after release, one per lock name ever
//! taken. Unlinking a lock file while another process waits on its
//! descriptor would let a third process lock a fresh inode under the same
//! name, so the directory is never pruned while the service runs. Per-key
//! files are empty and can be removed by the operator when no fetch is in
//! flight.

use crate::error::{ImageCacheError, ImageCacheResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock serialising image downloads when parallel downloads are disabled
pub const DOWNLOAD_LOCK: &str = "download-image";

/// Lock serialising master link-outs against cache clean-up
pub const MASTER_LOCK: &str = "master_image";

/// Name of the per-key download lock
pub fn download_lock_name(key: &str) -> String {
    format!("{}:{}", DOWNLOAD_LOCK, key)
}

/// Named lock service backed by lock files
#[derive(Debug, Clone)]
pub struct LockService {
    lock_dir: PathBuf,
}

/// A held named lock
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    _file: File,
}

impl LockGuard {
    /// Name the lock was acquired under
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("Released lock {}", self.name);
    }
}

impl LockService {
    /// Create a lock service, creating the lock directory if needed
    pub fn new(lock_dir: impl Into<PathBuf>) -> ImageCacheResult<Self> {
        let lock_dir = lock_dir.into();
        fs::create_dir_all(&lock_dir).map_err(|e| {
            ImageCacheError::io(format!("creating lock directory {}", lock_dir.display()), e)
        })?;
        Ok(Self { lock_dir })
    }

    /// Directory holding the lock files
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Acquire the named lock, waiting for any current holder
    pub async fn lock(&self, name: &str) -> ImageCacheResult<LockGuard> {
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| ImageCacheError::Lock {
                name: name.to_string(),
                source: e,
            })?;

        let file = tokio::task::spawn_blocking(move || flock_exclusive(&file).map(|()| file))
            .await
            .map_err(|e| ImageCacheError::Internal(format!("lock task failed: {}", e)))?
            .map_err(|e| ImageCacheError::Lock {
                name: name.to_string(),
                source: e,
            })?;

        debug!("Acquired lock {}", name);
        Ok(LockGuard {
            name: name.to_string(),
            _file: file,
        })
    }

    /// Lock file path for a lock name
    ///
    /// Lock names may contain characters that are not safe in file names,
    /// so the file name is a sanitised prefix plus a short name digest.
    fn lock_path(&self, name: &str) -> PathBuf {
        let prefix: String = name
            .chars()
            .take(32)
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();

        let digest = Sha256::digest(name.as_bytes());
        self.lock_dir
            .join(format!("{}-{}.lock", prefix, hex::encode(&digest[..6])))
    }
}

fn flock_exclusive(file: &File) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
