use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use filetime::FileTime;
use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::config::{Config, DiskCacheConfig};

use super::cache_key::file_name;
use super::{CacheEntry, Serializer};

/// Name of the directory holding in-progress writes, next to the individual caches.
pub const TMP_DIR: &str = "tmp";

/// The untyped state of a disk tier, shared by all clones.
pub(super) struct DiskCacheInner {
    pub(super) name: String,
    /// Directory holding the entries of this cache.
    pub(super) path: PathBuf,
    /// Directory holding in-progress writes, on the same filesystem as `path`.
    pub(super) tmp_dir: PathBuf,
    pub(super) config: DiskCacheConfig,
    /// Guards every mutation of `path` together with the read-modify-write of `size`.
    pub(super) lock: RwLock<()>,
    /// The sum of the sizes of all entries.
    pub(super) size: AtomicU64,
    /// Set while an eviction sweep runs.
    pub(super) evicting: AtomicBool,
}

/// The persistent tier.
///
/// Entries are stored as one file per key in `<cache_dir>/<name>/`, with file names derived from
/// the key by [`file_name`]. The modification time of a file is its last access time, it is
/// refreshed on every read and overwrite.
///
/// Writes first go to a temporary file in `<cache_dir>/tmp/` which is then atomically renamed into
/// place, so readers never observe a partially written entry.
pub struct DiskCache<T> {
    pub(super) inner: Arc<DiskCacheInner>,
    serializer: Arc<dyn Serializer<T>>,
}

impl<T: 'static> Clone for DiskCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<T: 'static> fmt::Debug for DiskCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("config", &self.inner.config)
            .field("size", &self.size())
            .finish()
    }
}

impl<T: 'static> DiskCache<T> {
    /// Opens the disk tier `name` inside `cache_dir`, creating the directories as needed.
    ///
    /// The size of the existing entries is recomputed by scanning the directory.
    pub fn open(
        name: &str,
        cache_dir: &Path,
        config: DiskCacheConfig,
        serializer: impl Serializer<T>,
    ) -> io::Result<Self> {
        if name.is_empty() || name == TMP_DIR || name.contains(['/', '\\']) || name.starts_with('.')
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid cache name `{name}`"),
            ));
        }

        let path = cache_dir.join(name);
        let tmp_dir = cache_dir.join(TMP_DIR);
        fs::create_dir_all(&path)?;
        fs::create_dir_all(&tmp_dir)?;

        let inner = DiskCacheInner {
            name: name.to_owned(),
            path,
            tmp_dir,
            config,
            lock: RwLock::new(()),
            size: AtomicU64::new(0),
            evicting: AtomicBool::new(false),
        };

        let size = inner.entries()?.iter().map(|entry| entry.size).sum();
        inner.size.store(size, Ordering::Release);
        tracing::debug!("Opened `{}` disk cache with {} bytes", name, size);
        metric!(gauge("caches.size.bytes") = size, "cache" => name);

        Ok(Self {
            inner: Arc::new(inner),
            serializer: Arc::new(serializer),
        })
    }

    /// Opens the disk tier `name` inside the configured cache directory.
    ///
    /// Returns `None` when no cache directory is configured.
    pub fn from_config(
        name: &str,
        config: &Config,
        serializer: impl Serializer<T>,
    ) -> io::Result<Option<Self>> {
        config
            .cache_dir
            .as_deref()
            .map(|cache_dir| Self::open(name, cache_dir, config.caches.disk, serializer))
            .transpose()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The directory holding the entries of this cache.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The aggregate size of all entries, in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size.load(Ordering::Acquire)
    }

    /// Reads and deserializes the entry for `key`.
    ///
    /// A missing entry is a [`CacheError::NotFound`](super::CacheError::NotFound). On success,
    /// the last access time is refreshed in the background.
    pub fn get(&self, key: &str) -> CacheEntry<T> {
        let path = self.inner.entry_path(key);
        let bytes = {
            let _guard = self.inner.lock.read();
            fs::read(&path)
        };

        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    metric!(counter("caches.file.miss") += 1, "cache" => &self.inner.name);
                }
                return Err(err.into());
            }
        };

        metric!(counter("caches.file.hit") += 1, "cache" => &self.inner.name);
        let value = self.serializer.deserialize(&bytes)?;
        self.touch_in_background(path);
        Ok(value)
    }

    /// Serializes `value` and stores it under `key`.
    pub fn set(&self, key: &str, value: &T) -> CacheEntry<()> {
        let bytes = self.serializer.serialize(value)?;
        self.set_bytes(key, &bytes)
    }

    /// Stores already serialized `bytes` under `key`.
    ///
    /// This replaces an existing entry, and then evicts the least recently used entries if the
    /// tier grew beyond its capacity.
    pub fn set_bytes(&self, key: &str, bytes: &[u8]) -> CacheEntry<()> {
        self.inner.set_bytes(key, bytes)?;
        self.inner.maybe_evict();
        Ok(())
    }

    /// Removes the entry for `key`, if any.
    pub fn remove(&self, key: &str) -> CacheEntry<()> {
        let path = self.inner.entry_path(key);
        let _guard = self.inner.lock.write();
        if let Some(metadata) = catch_not_found(|| path.metadata())? {
            catch_not_found(|| fs::remove_file(&path))?;
            self.inner.shrink(metadata.len());
        }
        Ok(())
    }

    /// Refreshes the last access time of the entry for `key`.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn touch(&self, key: &str) {
        self.inner.touch(&self.inner.entry_path(key));
    }

    /// Removes all entries of this cache.
    pub fn clear(&self) -> CacheEntry<()> {
        let _guard = self.inner.lock.write();
        for entry in self.inner.entries()? {
            catch_not_found(|| fs::remove_file(&entry.path))?;
            self.inner.shrink(entry.size);
        }
        tracing::debug!("Cleared `{}` disk cache", self.inner.name);
        Ok(())
    }

    /// Clears leftover temporary files.
    ///
    /// Files in the temporary directory belong to writes that never finished. This needs to happen
    /// on startup, before any writes are in flight, so that crashed writes do not pile up. The
    /// temporary directory is shared by all caches in the same cache directory.
    pub fn clear_tmp(&self) -> io::Result<()> {
        let _guard = self.inner.lock.write();
        let tmp = &self.inner.tmp_dir;
        if tmp.exists() {
            fs::remove_dir_all(tmp)?;
        }
        fs::create_dir_all(tmp)
    }

    fn touch_in_background(&self, path: PathBuf) {
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || inner.touch(&path));
            }
            Err(_) => inner.touch(&path),
        }
    }
}

impl DiskCacheInner {
    pub(super) fn entry_path(&self, key: &str) -> PathBuf {
        self.path.join(file_name(key))
    }

    fn set_bytes(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.entry_path(key);
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(bytes)?;
        temp_file.flush()?;

        let written = bytes.len() as u64;
        {
            let _guard = self.lock.write();
            let previous = catch_not_found(|| path.metadata())?.map_or(0, |m| m.len());
            persist_tempfile(temp_file, &path)?;
            self.shrink(previous);
            self.size.fetch_add(written, Ordering::AcqRel);
        }

        metric!(counter("caches.file.write") += 1, "cache" => &self.name);
        metric!(time_raw("caches.file.size") = written, "cache" => &self.name);
        Ok(())
    }

    /// Subtracts `bytes` from the aggregate size.
    ///
    /// Must be called with the write lock held.
    pub(super) fn shrink(&self, bytes: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                Some(size.saturating_sub(bytes))
            });
    }

    fn touch(&self, path: &Path) {
        let _guard = self.lock.write();
        match catch_not_found(|| filetime::set_file_mtime(path, FileTime::now())) {
            // the entry was removed in the meantime
            Ok(_) => {}
            Err(err) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to touch cache file: {:?}", err),
                );
            }
        }
    }

    /// Creates a new temporary file in the temporary directory.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // A concurrent `clear_tmp` could remove the directory we are operating in,
        // so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", self.tmp_dir.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", self.tmp_dir.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

/// Moves `temp_file` to `cache_path`, replacing an existing file.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to persist cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    }
}

/// Maps a `NotFound` error to `Ok(None)`.
pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
