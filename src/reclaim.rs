//! Disk-space reclamation across every cache on the host
//!
//! Components register a factory for their cache together with a priority.
//! When some operation needs room on a filesystem, caches living on that
//! device are asked to clean up, highest priority first, until enough space
//! is free.

use crate::cache::{ImageRef, MasterImageCache};
use crate::disk::{DiskSpace, Statvfs};
use crate::error::{ImageCacheError, ImageCacheResult};
use crate::fetch::Fetcher;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Produces the cache a component wants considered for reclamation
pub type CacheFactory = Arc<dyn Fn() -> Arc<MasterImageCache> + Send + Sync>;

struct Registration {
    priority: i32,
    factory: CacheFactory,
}

/// Process-wide registry of caches that may be cleaned to free disk space
pub struct CrossCacheCoordinator {
    registrations: RwLock<Vec<Registration>>,
    disk: Arc<dyn DiskSpace>,
}

impl Default for CrossCacheCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(Statvfs))
    }
}

impl CrossCacheCoordinator {
    pub fn new(disk: Arc<dyn DiskSpace>) -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            disk,
        }
    }

    /// Register a cache factory. Higher priorities are cleaned first; equal
    /// priorities keep registration order.
    pub fn register_for_cleanup<F>(&self, priority: i32, factory: F) -> ImageCacheResult<()>
    where
        F: Fn() -> Arc<MasterImageCache> + Send + Sync + 'static,
    {
        let mut registrations = self
            .registrations
            .write()
            .map_err(|_| ImageCacheError::Internal("cache registry lock poisoned".into()))?;
        registrations.push(Registration {
            priority,
            factory: Arc::new(factory),
        });
        registrations.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!("Registered cache for clean up with priority {}", priority);
        Ok(())
    }

    /// Number of registered caches
    pub fn len(&self) -> usize {
        self.registrations.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make sure more than `required` bytes are free on the filesystem
    /// holding `dir`, cleaning registered caches on the same device as needed.
    pub async fn reclaim_space(&self, dir: &Path, required: u64) -> ImageCacheResult<()> {
        let mut free = self.disk.free_bytes(dir)?;
        if required < free {
            return Ok(());
        }

        let device = self.disk.device_id(dir)?;
        let caches = self.caches_on_device(device)?;
        debug!(
            "Need {} bytes on {} but only {} free, {} candidate caches",
            required,
            dir.display(),
            free,
            caches.len()
        );

        for cache in caches {
            let amount = required - free;
            cache.clean_up(Some(amount)).await;

            free = self.disk.free_bytes(dir)?;
            if required < free {
                info!("Reclaimed enough disk space on {}", dir.display());
                return Ok(());
            }
        }

        warn!(
            "Unable to reclaim {} bytes on {}, {} free",
            required,
            dir.display(),
            free
        );
        Err(ImageCacheError::InsufficientDiskSpace {
            path: dir.to_path_buf(),
            required,
            actual: free,
        })
    }

    /// Reclaim room for the combined source size of `images`
    pub async fn reclaim_space_for_images(
        &self,
        fetcher: &dyn Fetcher,
        dir: &Path,
        images: &[ImageRef],
    ) -> ImageCacheResult<()> {
        let mut required: u64 = 0;
        for image in images {
            required = required.saturating_add(fetcher.query_remote_size(image).await?);
        }
        self.reclaim_space(dir, required).await
    }

    /// Registered caches with a master directory on `device`, in priority order
    fn caches_on_device(&self, device: u64) -> ImageCacheResult<Vec<Arc<MasterImageCache>>> {
        let factories: Vec<CacheFactory> = self
            .registrations
            .read()
            .map_err(|_| ImageCacheError::Internal("cache registry lock poisoned".into()))?
            .iter()
            .map(|r| Arc::clone(&r.factory))
            .collect();

        Ok(factories
            .iter()
            .map(|factory| factory())
            .filter(|cache| match cache.master_dir() {
                Some(master_dir) => match self.disk.device_id(master_dir) {
                    Ok(id) => id == device,
                    Err(e) => {
                        debug!("Skipping cache {}: {}", master_dir.display(), e);
                        false
                    }
                },
                None => false,
            })
            .collect())
    }
}

/// Fetch a batch of images for a deploy.
///
/// Space for the whole batch is reclaimed up front on the cache's filesystem
/// (the first destination's directory when caching is disabled), then each
/// image is fetched to its destination in order.
pub async fn fetch_images(
    coordinator: &CrossCacheCoordinator,
    fetcher: &dyn Fetcher,
    cache: &MasterImageCache,
    images: &[(ImageRef, PathBuf)],
    force_raw: bool,
) -> ImageCacheResult<()> {
    let Some((_, first_dest)) = images.first() else {
        return Ok(());
    };

    let dir = match cache.master_dir() {
        Some(dir) => dir.to_path_buf(),
        None => first_dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let refs: Vec<ImageRef> = images.iter().map(|(image, _)| image.clone()).collect();
    coordinator
        .reclaim_space_for_images(fetcher, &dir, &refs)
        .await?;

    for (image, dest) in images {
        cache.fetch(image, dest, force_raw).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::eviction::directory_size;
    use crate::config::CacheSettings;
    use crate::fetch::testing::ScriptedFetcher;
    use crate::lock::LockService;
    use std::fs;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Fixed-capacity filesystem whose usage is the size of the tracked
    /// directories
    struct FakeDisk {
        capacity: u64,
        tracked: Vec<PathBuf>,
        devices: Vec<(PathBuf, u64)>,
        queries: Mutex<u32>,
    }

    impl FakeDisk {
        fn new(capacity: u64, tracked: Vec<PathBuf>) -> Self {
            Self {
                capacity,
                tracked,
                devices: Vec::new(),
                queries: Mutex::new(0),
            }
        }

        fn on_device(mut self, root: PathBuf, id: u64) -> Self {
            self.devices.push((root, id));
            self
        }
    }

    impl DiskSpace for FakeDisk {
        fn free_bytes(&self, _path: &Path) -> ImageCacheResult<u64> {
            *self.queries.lock().unwrap() += 1;
            let used: u64 = self
                .tracked
                .iter()
                .map(|dir| directory_size(dir).unwrap())
                .sum();
            Ok(self.capacity.saturating_sub(used))
        }

        fn device_id(&self, path: &Path) -> ImageCacheResult<u64> {
            Ok(self
                .devices
                .iter()
                .find(|(root, _)| path.starts_with(root))
                .map_or(1, |(_, id)| *id))
        }
    }

    fn cache_in(root: &TempDir, name: &str, files: &[(&str, usize)]) -> Arc<MasterImageCache> {
        let master_dir = root.path().join(name);
        fs::create_dir_all(&master_dir).unwrap();
        for (file, size) in files {
            fs::write(master_dir.join(file), vec![0u8; *size]).unwrap();
        }
        let settings = CacheSettings {
            master_dir: Some(master_dir),
            cache_size_bytes: 1 << 30,
            cache_ttl: Duration::from_secs(3600),
            parallel_downloads: true,
            assume_fresh_without_timestamp: true,
        };
        let locks = LockService::new(root.path().join("locks")).unwrap();
        Arc::new(MasterImageCache::new(settings, locks, Arc::new(ScriptedFetcher::new())).unwrap())
    }

    fn register(coordinator: &CrossCacheCoordinator, priority: i32, cache: &Arc<MasterImageCache>) {
        let cache = Arc::clone(cache);
        coordinator
            .register_for_cleanup(priority, move || Arc::clone(&cache))
            .unwrap();
    }

    #[tokio::test]
    async fn enough_space_is_a_no_op() {
        let root = TempDir::new().unwrap();
        let a = cache_in(&root, "a", &[("img", 40)]);
        let disk = FakeDisk::new(1000, vec![root.path().join("a")]);
        let coordinator = CrossCacheCoordinator::new(Arc::new(disk));
        register(&coordinator, 10, &a);

        coordinator.reclaim_space(root.path(), 50).await.unwrap();

        assert!(root.path().join("a/img").exists());
    }

    #[tokio::test]
    async fn higher_priority_cache_is_cleaned_first() {
        let root = TempDir::new().unwrap();
        let a = cache_in(&root, "a", &[("img", 40)]);
        let b = cache_in(&root, "b", &[("img", 40)]);
        let disk = FakeDisk::new(81, vec![root.path().join("a"), root.path().join("b")]);
        let coordinator = CrossCacheCoordinator::new(Arc::new(disk));
        register(&coordinator, 10, &a);
        register(&coordinator, 90, &b);

        coordinator.reclaim_space(root.path(), 30).await.unwrap();

        assert!(root.path().join("a/img").exists());
        assert!(!root.path().join("b/img").exists());
    }

    #[tokio::test]
    async fn escalates_through_caches_until_satisfied() {
        let root = TempDir::new().unwrap();
        let first = cache_in(&root, "first", &[("img", 40)]);
        let second = cache_in(&root, "second", &[("img", 20)]);
        let third = cache_in(&root, "third", &[("img", 20)]);
        let disk = FakeDisk::new(
            81,
            vec![
                root.path().join("first"),
                root.path().join("second"),
                root.path().join("third"),
            ],
        );
        let coordinator = CrossCacheCoordinator::new(Arc::new(disk));
        register(&coordinator, 50, &second);
        register(&coordinator, 100, &first);
        register(&coordinator, 10, &third);

        // free = 1, first frees 40, second frees the remainder
        coordinator.reclaim_space(root.path(), 50).await.unwrap();

        assert!(!root.path().join("first/img").exists());
        assert!(!root.path().join("second/img").exists());
        assert!(root.path().join("third/img").exists());
    }

    #[tokio::test]
    async fn reports_residual_when_caches_run_out() {
        let root = TempDir::new().unwrap();
        let a = cache_in(&root, "a", &[("img", 10)]);
        let disk = FakeDisk::new(15, vec![root.path().join("a")]);
        let coordinator = CrossCacheCoordinator::new(Arc::new(disk));
        register(&coordinator, 10, &a);

        let err = coordinator.reclaim_space(root.path(), 100).await.unwrap_err();

        match err {
            ImageCacheError::InsufficientDiskSpace { required, actual, .. } => {
                assert_eq!(required, 100);
                assert_eq!(actual, 15);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn in_use_masters_are_never_reclaimed() {
        let root = TempDir::new().unwrap();
        let a = cache_in(&root, "a", &[("img", 40)]);
        fs::hard_link(root.path().join("a/img"), root.path().join("deployed")).unwrap();
        let disk = FakeDisk::new(41, vec![root.path().join("a")]);
        let coordinator = CrossCacheCoordinator::new(Arc::new(disk));
        register(&coordinator, 10, &a);

        assert!(coordinator.reclaim_space(root.path(), 20).await.is_err());
        assert!(root.path().join("a/img").exists());
    }

    #[tokio::test]
    async fn caches_on_other_devices_are_skipped() {
        let root = TempDir::new().unwrap();
        let local = cache_in(&root, "local", &[("img", 40)]);
        let remote = cache_in(&root, "remote", &[("img", 40)]);
        let disk = FakeDisk::new(41, vec![root.path().join("local")])
            .on_device(root.path().join("remote"), 2);
        let coordinator = CrossCacheCoordinator::new(Arc::new(disk));
        register(&coordinator, 100, &remote);
        register(&coordinator, 10, &local);

        coordinator.reclaim_space(root.path(), 20).await.unwrap();

        assert!(root.path().join("remote/img").exists());
        assert!(!root.path().join("local/img").exists());
    }

    #[tokio::test]
    async fn disabled_caches_are_skipped() {
        let root = TempDir::new().unwrap();
        let locks = LockService::new(root.path().join("locks")).unwrap();
        let disabled = Arc::new(
            MasterImageCache::new(CacheSettings::default(), locks, Arc::new(ScriptedFetcher::new()))
                .unwrap(),
        );
        let coordinator = CrossCacheCoordinator::new(Arc::new(FakeDisk::new(5, Vec::new())));
        register(&coordinator, 10, &disabled);

        assert!(coordinator.reclaim_space(root.path(), 10).await.is_err());
    }

    #[test]
    fn registrations_are_counted() {
        let root = TempDir::new().unwrap();
        let a = cache_in(&root, "a", &[]);
        let coordinator = CrossCacheCoordinator::new(Arc::new(FakeDisk::new(5, Vec::new())));
        assert!(coordinator.is_empty());
        register(&coordinator, 1, &a);
        register(&coordinator, 1, &a);
        assert_eq!(coordinator.len(), 2);
    }

    #[tokio::test]
    async fn reclaims_for_combined_image_sizes() {
        let root = TempDir::new().unwrap();
        let a = cache_in(&root, "a", &[("old", 30)]);
        let disk = FakeDisk::new(60, vec![root.path().join("a")]);
        let coordinator = CrossCacheCoordinator::new(Arc::new(disk));
        register(&coordinator, 10, &a);
        let fetcher = ScriptedFetcher::new()
            .with_image("http://x/kernel", &[0u8; 20])
            .with_image("http://x/ramdisk", &[0u8; 20]);

        // 30 free, 40 needed
        coordinator
            .reclaim_space_for_images(
                &fetcher,
                root.path(),
                &[ImageRef::parse("http://x/kernel"), ImageRef::parse("http://x/ramdisk")],
            )
            .await
            .unwrap();

        assert!(!root.path().join("a/old").exists());
    }

    #[tokio::test]
    async fn fetch_images_reclaims_then_fetches_each() {
        let root = TempDir::new().unwrap();
        let master_dir = root.path().join("master");
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .with_image("http://x/kernel", b"kernel")
                .with_image("http://x/ramdisk", b"ramdisk"),
        );
        let settings = CacheSettings {
            master_dir: Some(master_dir.clone()),
            ..CacheSettings::default()
        };
        let locks = LockService::new(root.path().join("locks")).unwrap();
        let cache = MasterImageCache::new(settings, locks, fetcher.clone()).unwrap();
        let disk = Arc::new(FakeDisk::new(1 << 20, vec![master_dir]));
        let coordinator = CrossCacheCoordinator::new(disk.clone());

        let images = vec![
            (ImageRef::parse("http://x/kernel"), root.path().join("kernel")),
            (ImageRef::parse("http://x/ramdisk"), root.path().join("ramdisk")),
        ];
        fetch_images(&coordinator, fetcher.as_ref(), &cache, &images, false)
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(fs::read(root.path().join("ramdisk")).unwrap(), b"ramdisk");
        assert!(*disk.queries.lock().unwrap() >= 1);
    }

    #[tokio::test]
    async fn fetch_images_with_nothing_to_fetch() {
        let root = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::new();
        let cache = cache_in(&root, "a", &[]);
        let coordinator = CrossCacheCoordinator::new(Arc::new(FakeDisk::new(0, Vec::new())));

        fetch_images(&coordinator, &fetcher, &cache, &[], true)
            .await
            .unwrap();
        assert!(fetcher.calls().is_empty());
    }
}
