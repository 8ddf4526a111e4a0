use std::fs::{read_dir, remove_file};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use filetime::FileTime;

use crate::utils::defer::defer;

use super::cache_key::is_entry_file_name;
use super::fs::{DiskCacheInner, catch_not_found};
use super::{CacheEntry, DiskCache};

/// The outcome of a cleanup or eviction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl CleanupStats {
    fn remove(&mut self, size: u64) {
        self.removed_files += 1;
        self.removed_bytes += size;
    }

    fn retain(&mut self, size: u64) {
        self.retained_files += 1;
        self.retained_bytes += size;
    }
}

/// A single file of the disk tier.
#[derive(Debug)]
pub(super) struct DiskEntry {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub last_access: FileTime,
}

impl<T: 'static> DiskCache<T> {
    /// Removes all entries that were last accessed before `cutoff`.
    pub fn remove_older_than(&self, cutoff: SystemTime) -> CacheEntry<CleanupStats> {
        let cutoff = FileTime::from_system_time(cutoff);
        Ok(self.inner.remove_older_than(cutoff, false)?)
    }

    /// Cleans up this cache based on the configured retention.
    ///
    /// Removes entries unused for longer than `max_unused_for`, and then evicts entries if the
    /// cache is still over capacity. If `dry_run` is `true`, no files will actually be deleted,
    /// and eviction is skipped.
    pub fn cleanup(&self, dry_run: bool) -> CacheEntry<CleanupStats> {
        let inner = &self.inner;
        tracing::info!("Cleaning up `{}` cache", inner.name);

        let cutoff = inner
            .config
            .max_unused_for
            .and_then(|max_unused_for| SystemTime::now().checked_sub(max_unused_for))
            .map(FileTime::from_system_time);

        let mut stats = match cutoff {
            Some(cutoff) => inner.remove_older_than(cutoff, dry_run)?,
            None => {
                let mut stats = CleanupStats::default();
                let _guard = inner.lock.read();
                for entry in inner.entries()? {
                    stats.retain(entry.size);
                }
                stats
            }
        };

        if !dry_run {
            if let Some(evicted) = inner.maybe_evict() {
                stats.removed_files += evicted.removed_files;
                stats.removed_bytes += evicted.removed_bytes;
                stats.retained_files = evicted.retained_files;
                stats.retained_bytes = evicted.retained_bytes;
            }
        }

        tracing::info!("Cleaning up `{}` complete", inner.name);
        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => &inner.name);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => &inner.name);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64, "cache" => &inner.name);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64, "cache" => &inner.name);

        Ok(stats)
    }
}

impl DiskCacheInner {
    /// Lists all entries of this cache.
    ///
    /// Files that were not written by the cache, and files that vanish while listing, are
    /// skipped.
    pub(super) fn entries(&self) -> io::Result<Vec<DiskEntry>> {
        let Some(dir) = catch_not_found(|| read_dir(&self.path))? else {
            tracing::warn!("Directory not found: `{}`", self.path.display());
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry?;
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_entry_file_name(&file_name) {
                continue;
            }
            let path = entry.path();
            let Some(metadata) = catch_not_found(|| path.metadata())? else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            entries.push(DiskEntry {
                file_name,
                path,
                size: metadata.len(),
                last_access: FileTime::from_last_modification_time(&metadata),
            });
        }
        Ok(entries)
    }

    fn remove_older_than(&self, cutoff: FileTime, dry_run: bool) -> io::Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        let _guard = self.lock.write();

        for entry in self.entries()? {
            tracing::trace!("Checking file `{}`", entry.path.display());
            if entry.last_access >= cutoff {
                stats.retain(entry.size);
                continue;
            }

            tracing::debug!("Removing file `{}`", entry.path.display());
            if !dry_run {
                if let Err(e) = catch_not_found(|| remove_file(&entry.path)) {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", entry.path.display().to_string().into()),
                        || tracing::error!("Failed to clean cache file: {:?}", e),
                    );
                    stats.retain(entry.size);
                    continue;
                }
                self.shrink(entry.size);
            }
            stats.remove(entry.size);
        }

        Ok(stats)
    }

    /// Evicts the least recently used entries if the cache grew beyond its capacity.
    ///
    /// Only one sweep runs at a time, concurrent calls return immediately. Failures are logged.
    /// Returns the stats of the sweep, if one ran.
    pub(super) fn maybe_evict(&self) -> Option<CleanupStats> {
        let max_capacity = self.config.max_capacity;
        if max_capacity == 0 || self.size.load(Ordering::Acquire) <= max_capacity {
            return None;
        }
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _evicting = defer(|| self.evicting.store(false, Ordering::Release));

        // sweep down to 80% of the capacity
        match self.evict(max_capacity - max_capacity / 5) {
            Ok(stats) => {
                tracing::debug!(
                    "Evicted {} files ({} bytes) from `{}` cache",
                    stats.removed_files,
                    stats.removed_bytes,
                    self.name,
                );
                metric!(counter("caches.eviction.files") += stats.removed_files as i64, "cache" => &self.name);
                metric!(counter("caches.eviction.bytes") += stats.removed_bytes as i64, "cache" => &self.name);
                metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => &self.name);
                Some(stats)
            }
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", self.path.display().to_string().into()),
                    || tracing::error!("Failed to evict from cache: {:?}", e),
                );
                metric!(counter("caches.eviction.failed") += 1, "cache" => &self.name);
                None
            }
        }
    }

    /// Removes entries, least recently accessed first, until the size is at most `target`.
    fn evict(&self, target: u64) -> io::Result<CleanupStats> {
        let _guard = self.lock.write();

        let mut entries = self.entries()?;
        entries.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });

        let mut stats = CleanupStats::default();
        for entry in entries {
            if self.size.load(Ordering::Acquire) <= target {
                stats.retain(entry.size);
                continue;
            }

            tracing::trace!("Evicting file `{}`", entry.path.display());
            if let Err(e) = catch_not_found(|| remove_file(&entry.path)) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", entry.path.display().to_string().into()),
                    || tracing::error!("Failed to evict cache file: {:?}", e),
                );
                stats.retain(entry.size);
                continue;
            }
            self.shrink(entry.size);
            stats.remove(entry.size);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use crate::caching::{BytesSerializer, CacheError};
    use crate::config::DiskCacheConfig;

    use super::*;

    fn open(dir: &Path, max_capacity: u64, max_unused_for: Option<Duration>) -> DiskCache<Vec<u8>> {
        let config = DiskCacheConfig {
            max_capacity,
            max_unused_for,
        };
        DiskCache::open("test", dir, config, BytesSerializer).unwrap()
    }

    fn set_last_access(cache: &DiskCache<Vec<u8>>, key: &str, unix_seconds: i64) {
        let path = cache.inner.entry_path(key);
        filetime::set_file_mtime(path, FileTime::from_unix_time(unix_seconds, 0)).unwrap();
    }

    #[test]
    fn test_eviction_removes_least_recently_used() {
        tiercache_test::setup();
        let dir = tiercache_test::tempdir();
        let cache = open(dir.path(), 100, None);

        for i in 0..10 {
            cache.set_bytes(&i.to_string(), &[0; 10]).unwrap();
        }
        // exactly at capacity does not evict
        assert_eq!(cache.size(), 100);

        // access order is the reverse of the write order
        for i in 0..10 {
            set_last_access(&cache, &i.to_string(), 1_000_000 - i);
        }

        cache.set_bytes("new", &[0; 10]).unwrap();
        assert_eq!(cache.size(), 80);

        for i in 0..10 {
            let result = cache.get(&i.to_string());
            if i >= 7 {
                assert_eq!(result, Err(CacheError::NotFound), "{i} should be evicted");
            } else {
                assert!(result.is_ok(), "{i} should be retained");
            }
        }
        assert!(cache.get("new").is_ok());
    }

    #[test]
    fn test_eviction_ties_by_file_name() {
        let dir = tiercache_test::tempdir();
        let cache = open(dir.path(), 30, None);

        for key in ["c", "a", "b"] {
            cache.set_bytes(key, &[0; 10]).unwrap();
            set_last_access(&cache, key, 1_000_000);
        }
        cache.set_bytes("d", &[0; 10]).unwrap();

        // down to 24 bytes means two entries have to go
        assert_eq!(cache.size(), 20);
        assert_eq!(cache.get("a"), Err(CacheError::NotFound));
        assert_eq!(cache.get("b"), Err(CacheError::NotFound));
        assert!(cache.get("c").is_ok());
        assert!(cache.get("d").is_ok());
    }

    #[test]
    fn test_eviction_disabled() {
        let dir = tiercache_test::tempdir();
        let cache = open(dir.path(), 0, None);

        for i in 0..10 {
            cache.set_bytes(&i.to_string(), &[0; 1000]).unwrap();
        }
        assert_eq!(cache.size(), 10_000);
        assert!(cache.inner.maybe_evict().is_none());
    }

    #[test]
    fn test_remove_older_than() {
        let dir = tiercache_test::tempdir();
        let cache = open(dir.path(), 0, None);

        cache.set_bytes("old", &[0; 5]).unwrap();
        cache.set_bytes("new", &[0; 7]).unwrap();
        set_last_access(&cache, "old", 1_000_000);

        let cutoff = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000);
        let stats = cache.remove_older_than(cutoff).unwrap();
        assert_eq!(
            stats,
            CleanupStats {
                removed_files: 1,
                removed_bytes: 5,
                retained_files: 1,
                retained_bytes: 7,
            }
        );
        assert_eq!(cache.size(), 7);
        assert_eq!(cache.get("old"), Err(CacheError::NotFound));
    }

    #[test]
    fn test_cleanup() {
        let dir = tiercache_test::tempdir();
        let cache = open(dir.path(), 0, Some(Duration::from_secs(3600)));

        cache.set_bytes("old", &[0; 5]).unwrap();
        cache.set_bytes("new", &[0; 7]).unwrap();
        set_last_access(&cache, "old", 1_000_000);

        let stats = cache.cleanup(true).unwrap();
        assert_eq!(stats.removed_files, 1);
        assert!(cache.get("old").is_ok());
        assert_eq!(cache.size(), 12);

        set_last_access(&cache, "old", 1_000_000);
        let stats = cache.cleanup(false).unwrap();
        assert_eq!(stats.removed_files, 1);
        assert_eq!(stats.retained_bytes, 7);
        assert_eq!(cache.get("old"), Err(CacheError::NotFound));
        assert_eq!(cache.size(), 7);
    }

    #[test]
    fn test_cleanup_evicts_over_capacity() {
        let dir = tiercache_test::tempdir();
        let cache = open(dir.path(), 0, None);
        for i in 0..4 {
            cache.set_bytes(&i.to_string(), &[0; 10]).unwrap();
            set_last_access(&cache, &i.to_string(), 1_000_000 + i);
        }

        // the capacity shrank between runs
        let cache = open(dir.path(), 20, None);
        let stats = cache.cleanup(false).unwrap();
        assert_eq!(stats.removed_files, 3);
        assert_eq!(stats.retained_files, 1);
        assert_eq!(cache.size(), 10);
        assert!(cache.get("3").is_ok());
    }

    /// Sums up the sizes of the entry files, independently of the tracked size.
    fn size_on_disk(cache: &DiskCache<Vec<u8>>) -> u64 {
        std::fs::read_dir(cache.path())
            .unwrap()
            .map(|entry| entry.unwrap().metadata().unwrap())
            .filter(|metadata| metadata.is_file())
            .map(|metadata| metadata.len())
            .sum()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_size_accounting_under_contention() {
        tiercache_test::setup();
        let dir = tiercache_test::tempdir();
        let cache = open(dir.path(), 5000, None);

        let tasks: Vec<_> = (0..16)
            .map(|task| {
                let cache = cache.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..200usize {
                        // a small key space, so writers and removers collide
                        let key = ((task * 7 + i) % 40).to_string();
                        if i % 3 == 0 {
                            cache.remove(&key).unwrap();
                        } else {
                            let len = (i * 13 + task) % 50 + 1;
                            cache.set_bytes(&key, &vec![0; len]).unwrap();
                        }
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.size(), size_on_disk(&cache));

        // keep writing until the capacity is exceeded once more
        let mut evicted = false;
        for i in 0..20 {
            let before = cache.size();
            cache.set_bytes(&format!("fill-{i}"), &[0; 500]).unwrap();
            if cache.size() < before + 500 {
                evicted = true;
                break;
            }
        }
        assert!(evicted);
        assert!(cache.size() <= 4000, "size {} above the eviction target", cache.size());
        assert_eq!(cache.size(), size_on_disk(&cache));
    }
}
