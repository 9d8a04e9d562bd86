//! Two-stage eviction of master images
//!
//! Stage one deletes every unreferenced master whose last use is older than
//! the TTL. Stage two deletes the oldest surviving unreferenced masters until
//! the directory fits its size budget and any explicitly requested amount has
//! been freed.
//!
//! A master is unreferenced when its hard-link count is 1. Masters linked to
//! at least one destination are never listed as candidates, whatever their
//! age or the size pressure.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Cache size status relative to configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSizeStatus {
    /// Under 80% of limit
    Ok,
    /// Between 80% and 100% of limit
    Warning,
    /// Over the limit
    Exceeded,
}

impl CacheSizeStatus {
    /// Determine status based on current size and limit
    pub fn from_usage(current_bytes: u64, limit_bytes: u64) -> Self {
        let percent = Self::percentage(current_bytes, limit_bytes);
        if current_bytes > limit_bytes {
            Self::Exceeded
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of limit used
    pub fn percentage(current_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return if current_bytes == 0 { 0.0 } else { 100.0 };
        }
        (current_bytes as f64 / limit_bytes as f64) * 100.0
    }
}

/// Eviction parameters of one cache
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    /// Soft ceiling on the directory size
    pub cache_size_bytes: u64,
    /// Age after last use at which an unreferenced master expires
    pub cache_ttl: Duration,
}

/// A regular file in the master directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterEntry {
    pub path: PathBuf,
    pub size: u64,
    /// Hard-link count; more than one means a destination still uses it
    pub links: u64,
    pub last_used: SystemTime,
}

impl MasterEntry {
    /// Build an entry from file metadata
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        Self {
            path,
            size: metadata.len(),
            links: metadata.nlink(),
            last_used: last_used(metadata),
        }
    }

    /// Whether any destination still links to this master
    pub fn in_use(&self) -> bool {
        self.links > 1
    }

    /// File name of the entry (the cache key, possibly with a suffix)
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Most recent of modification, access and status-change time.
///
/// Access time may be disabled by mount options; status-change time moves
/// whenever a new hard link is created, which marks a master as used on every
/// link-out.
pub fn last_used(metadata: &Metadata) -> SystemTime {
    let ctime = system_time(metadata.ctime(), metadata.ctime_nsec());
    [metadata.modified().ok(), metadata.accessed().ok(), ctime]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(UNIX_EPOCH)
}

fn system_time(secs: i64, nsecs: i64) -> Option<SystemTime> {
    let secs = u64::try_from(secs).ok()?;
    let nsecs = u32::try_from(nsecs).ok()?;
    UNIX_EPOCH.checked_add(Duration::new(secs, nsecs))
}

/// All regular files directly under `dir`
pub fn list_entries(dir: &Path) -> io::Result<Vec<MasterEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // Entries may vanish between listing and stat
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if metadata.is_file() {
            entries.push(MasterEntry::from_metadata(path, &metadata));
        }
    }
    Ok(entries)
}

/// Unreferenced masters under `dir`, the only files eviction may delete
pub fn find_candidates(dir: &Path) -> io::Result<Vec<MasterEntry>> {
    Ok(list_entries(dir)?
        .into_iter()
        .filter(|entry| !entry.in_use())
        .collect())
}

/// Total size of every entry directly under `dir`, referenced or not
pub fn directory_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(metadata) = fs::metadata(entry.path()) {
            total = total.saturating_add(metadata.len());
        }
    }
    Ok(total)
}

/// Stage one: delete candidates last used before `threshold`.
///
/// With a requested `amount`, stops as soon as that many bytes have been
/// freed. Returns the entries that were not deleted and the amount still
/// required (zero or negative once satisfied).
pub fn clean_up_too_old<F>(
    listing: Vec<MasterEntry>,
    threshold: SystemTime,
    mut amount: Option<i64>,
    remove: &mut F,
) -> (Vec<MasterEntry>, Option<i64>)
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let mut survived = Vec::with_capacity(listing.len());
    let mut entries = listing.into_iter();

    while let Some(entry) = entries.next() {
        if entry.last_used >= threshold {
            survived.push(entry);
            continue;
        }

        match remove(&entry.path) {
            Ok(()) => {
                info!(
                    "Removed expired master image {} ({})",
                    entry.file_name(),
                    format_bytes(entry.size)
                );
                if let Some(left) = amount.as_mut() {
                    *left -= size_as_i64(entry.size);
                    if *left <= 0 {
                        survived.extend(entries);
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Unable to delete file {} from master image cache: {}",
                    entry.path.display(),
                    e
                );
            }
        }
    }

    (survived, amount)
}

/// Stage two: delete the oldest candidates while the directory is over
/// `cache_size` or a requested `amount` is still outstanding.
///
/// `total_size` is the size of the whole directory, not just the listing.
/// Returns the amount still required (0 when no amount was requested).
pub fn clean_up_ensure_cache_size<F>(
    mut listing: Vec<MasterEntry>,
    mut total_size: u64,
    cache_size: u64,
    mut amount: Option<i64>,
    remove: &mut F,
) -> u64
where
    F: FnMut(&Path) -> io::Result<()>,
{
    // Newest first, so popping yields the oldest
    listing.sort_by(|a, b| {
        b.last_used
            .cmp(&a.last_used)
            .then_with(|| b.path.cmp(&a.path))
    });

    while total_size > cache_size || amount.is_some_and(|left| left > 0) {
        let Some(entry) = listing.pop() else {
            break;
        };

        match remove(&entry.path) {
            Ok(()) => {
                info!(
                    "Evicted master image {} ({})",
                    entry.file_name(),
                    format_bytes(entry.size)
                );
                total_size = total_size.saturating_sub(entry.size);
                if let Some(left) = amount.as_mut() {
                    *left -= size_as_i64(entry.size);
                }
            }
            Err(e) => {
                warn!(
                    "Unable to delete file {} from master image cache: {}",
                    entry.path.display(),
                    e
                );
            }
        }
    }

    if total_size > cache_size {
        warn!(
            "Master image cache is still {} over its {} budget after clean up",
            format_bytes(total_size - cache_size),
            format_bytes(cache_size)
        );
    }

    amount.map_or(0, |left| u64::try_from(left).unwrap_or(0))
}

/// Run both stages over `master_dir` as of `now`.
///
/// Returns the part of `amount` that could not be freed. Deletion failures
/// are logged and skipped.
pub fn sweep(
    master_dir: &Path,
    policy: &EvictionPolicy,
    now: SystemTime,
    amount: Option<u64>,
) -> io::Result<u64> {
    let mut remove = |path: &Path| fs::remove_file(path);

    let listing = find_candidates(master_dir)?;
    let threshold = now.checked_sub(policy.cache_ttl).unwrap_or(UNIX_EPOCH);
    debug!(
        "Sweeping {} unreferenced master images in {}",
        listing.len(),
        master_dir.display()
    );

    let (survived, amount) =
        clean_up_too_old(listing, threshold, amount.map(size_as_i64), &mut remove);
    if amount.is_some_and(|left| left <= 0) {
        return Ok(0);
    }

    let total_size = directory_size(master_dir)?;
    Ok(clean_up_ensure_cache_size(
        survived,
        total_size,
        policy.cache_size_bytes,
        amount,
        &mut remove,
    ))
}

fn size_as_i64(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}
