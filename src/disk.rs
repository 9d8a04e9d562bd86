//! Filesystem space and device queries

use crate::error::{ImageCacheError, ImageCacheResult};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Free-space and device information for paths on local filesystems
pub trait DiskSpace: Send + Sync {
    /// Bytes available to unprivileged users on the filesystem holding `path`
    fn free_bytes(&self, path: &Path) -> ImageCacheResult<u64>;

    /// Device identifier of the filesystem holding `path`
    fn device_id(&self, path: &Path) -> ImageCacheResult<u64>;
}

/// `statvfs(3)` backed implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct Statvfs;

impl DiskSpace for Statvfs {
    fn free_bytes(&self, path: &Path) -> ImageCacheResult<u64> {
        free_bytes(path)
    }

    fn device_id(&self, path: &Path) -> ImageCacheResult<u64> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| ImageCacheError::io(format!("stat {}", path.display()), e))?;
        Ok(metadata.dev())
    }
}

/// Free space for `path` as fragment size times available blocks
pub fn free_bytes(path: &Path) -> ImageCacheResult<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ImageCacheError::io(
            format!("statvfs {}", path.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
        )
    })?;

    // SAFETY: zeroed statvfs is a valid out-parameter and c_path is NUL-terminated.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(ImageCacheError::io(
            format!("statvfs {}", path.display()),
            io::Error::last_os_error(),
        ));
    }

    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_frsize as u64 * stat.f_bavail as u64)
}
