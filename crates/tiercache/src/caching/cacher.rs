use std::fmt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{Config, PipelineConfig};
use crate::utils::defer::defer;

use super::coalesce::{Completion, Operation, Registry};
use super::descriptor::process_chain;
use super::{
    CacheEntry, CacheError, Descriptor, DiskCache, FetchResult, Fetcher, MemoryCache,
    MemoryPressure, PressureSubscription, Serializer,
};

/// A snapshot of the state of a [`TieredCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    /// Approximate number of entries in the memory tier.
    pub memory_entries: u64,
    /// Size of the disk tier in bytes, `None` without a disk tier.
    pub disk_bytes: Option<u64>,
    /// Lookups currently in flight.
    pub pending_lookups: usize,
    /// Fetches currently in flight.
    pub pending_fetches: usize,
}

struct Tiers<T> {
    name: String,
    memory: MemoryCache<T>,
    disk: Option<DiskCache<T>>,
    lookups: Registry<T>,
    fetches: Registry<FetchResult<T>>,
    pipeline: PipelineConfig,
}

/// A two-tier cache with a fetch and derive pipeline.
///
/// Values are looked up in memory first, then on disk. On a full miss, the raw value is fetched
/// and derived through the [`Descriptor`]'s processor chain, and the result is written back into
/// both tiers. Concurrent lookups of the same derived key share a single lookup, and lookups
/// sharing a fetcher identifier share a single fetch.
///
/// Without a disk tier, the cache only keeps values in memory.
pub struct TieredCache<T> {
    inner: Arc<Tiers<T>>,
}

impl<T: 'static> Clone for TieredCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> fmt::Debug for TieredCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.inner.name)
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .field("pipeline", &self.inner.pipeline)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> TieredCache<T> {
    pub fn new(
        name: &str,
        memory: MemoryCache<T>,
        disk: Option<DiskCache<T>>,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Tiers {
                name: name.to_owned(),
                memory,
                disk,
                lookups: Registry::new("lookups"),
                fetches: Registry::new("fetches"),
                pipeline,
            }),
        }
    }

    /// Creates the cache `name` with both tiers set up from `config`.
    ///
    /// The disk tier is only created if a cache directory is configured. The memory tier weighs
    /// values by their shallow size, see [`MemoryCache::new`].
    pub fn from_config(
        name: &str,
        config: &Config,
        serializer: impl Serializer<T>,
    ) -> io::Result<Self> {
        Self::from_config_with_weigher(name, config, serializer, |value| {
            std::mem::size_of_val(value) as u32
        })
    }

    /// Like [`from_config`](Self::from_config), weighing memory entries with `weigher`.
    pub fn from_config_with_weigher<W>(
        name: &str,
        config: &Config,
        serializer: impl Serializer<T>,
        weigher: W,
    ) -> io::Result<Self>
    where
        W: Fn(&T) -> u32 + Send + Sync + 'static,
    {
        let memory = MemoryCache::with_weigher(name, &config.caches.in_memory, weigher);
        let disk = DiskCache::from_config(name, config, serializer)?;
        Ok(Self::new(name, memory, disk, config.caches.pipeline))
    }

    pub fn memory(&self) -> &MemoryCache<T> {
        &self.inner.memory
    }

    pub fn disk(&self) -> Option<&DiskCache<T>> {
        self.inner.disk.as_ref()
    }

    /// Subscribes the memory tier to `pressure`.
    pub fn subscribe_memory_pressure(&self, pressure: &MemoryPressure) -> PressureSubscription {
        pressure.subscribe(&self.inner.memory)
    }

    /// Returns the value cached for `key` without ever fetching it.
    ///
    /// Looks into the memory tier and then the disk tier. A value found on disk is put into
    /// memory. A missing or undecodable entry is `Ok(None)`.
    pub fn peek(&self, key: &str) -> CacheEntry<Option<T>> {
        let inner = &self.inner;
        metric!(counter("caches.access") += 1, "cache" => &inner.name, "op" => "peek");

        if let Some(value) = inner.memory.get(key) {
            return Ok(Some(value));
        }
        let Some(disk) = &inner.disk else {
            return Ok(None);
        };
        match disk.get(key) {
            Ok(value) => {
                inner.memory.set(key, value.clone());
                Ok(Some(value))
            }
            Err(err) if err.is_miss() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Resolves the value described by `descriptor`.
    ///
    /// The returned [`Resolve`] is a future, and can cancel the lookup. All of the work happens in
    /// spawned tasks, so this needs to be called within a tokio runtime.
    pub fn resolve(&self, descriptor: Descriptor<T>) -> Resolve<T> {
        let inner = &self.inner;
        let key = descriptor.derived_key();
        metric!(counter("caches.access") += 1, "cache" => &inner.name, "op" => "resolve");

        if let Some(value) = inner.memory.get(key) {
            tracing::trace!("Memory hit for `{}`", key);
            return Resolve {
                operation: None,
                completion: Completion::ready(Ok(value)),
            };
        }

        let (operation, is_new) = inner.lookups.register(key);
        let completion = operation.subscribe();
        if is_new {
            let tiers = Arc::clone(inner);
            let lookup = operation.clone();
            let span = tracing::trace_span!("lookup", key = %key);
            let handle = tokio::spawn(
                async move {
                    // completes the lookup if this task is aborted
                    let canceled = lookup.clone();
                    let _guard = defer(move || canceled.cancel());

                    let result = AssertUnwindSafe(tiers.lookup(&descriptor, &lookup))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(CacheError::processing(format!(
                                "lookup panicked: {}",
                                panic_message(&*panic)
                            )))
                        });
                    if let Err(err) = &result {
                        tracing::trace!("Lookup failed: {}", err);
                        metric!(counter("caches.lookup.failed") += 1, "cache" => &tiers.name, "reason" => err.metrics_tag());
                    }
                    lookup.complete(result);
                }
                .instrument(span),
            );
            operation.attach(handle.abort_handle());
        } else {
            tracing::trace!("Joined pending lookup for `{}`", key);
        }

        Resolve {
            operation: Some(operation),
            completion,
        }
    }

    /// Puts `value` into the memory tier, and writes it to the disk tier in the background.
    ///
    /// The returned [`WriteHandle`] resolves once the disk write finished. It can be dropped
    /// without affecting the write.
    pub fn put(&self, key: &str, value: T) -> WriteHandle {
        let inner = &self.inner;
        inner.memory.set(key, value.clone());

        let Some(disk) = inner.disk.clone() else {
            return WriteHandle::done(Ok(()));
        };
        let key = key.to_owned();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => WriteHandle {
                state: WriteState::Pending(
                    handle.spawn_blocking(move || write_to_disk(&disk, &key, &value, None)),
                ),
            },
            Err(_) => WriteHandle::done(write_to_disk(&disk, &key, &value, None)),
        }
    }

    /// Removes `key` from both tiers.
    pub fn invalidate(&self, key: &str) -> CacheEntry<()> {
        self.inner.memory.remove(key);
        match &self.inner.disk {
            Some(disk) => disk.remove(key),
            None => Ok(()),
        }
    }

    /// Removes all entries from both tiers.
    pub fn clear(&self) -> CacheEntry<()> {
        self.inner.memory.clear();
        match &self.inner.disk {
            Some(disk) => disk.clear(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            memory_entries: inner.memory.entry_count(),
            disk_bytes: inner.disk.as_ref().map(|disk| disk.size()),
            pending_lookups: inner.lookups.len(),
            pending_fetches: inner.fetches.len(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Tiers<T> {
    async fn lookup(
        self: &Arc<Self>,
        descriptor: &Descriptor<T>,
        lookup: &Operation<T>,
    ) -> CacheEntry<T> {
        let derived_key = descriptor.derived_key();

        // a previous lookup may have completed since the memory check in `resolve`
        if let Some(value) = self.memory.get(derived_key) {
            return Ok(value);
        }

        if let Some(value) = self.disk_get(derived_key).await {
            tracing::trace!("Disk hit");
            self.memory.set(derived_key, value.clone());
            return Ok(value);
        }

        let raw = if descriptor.has_processors() {
            self.raw_get(descriptor.key()).await
        } else {
            None
        };

        let (raw, bytes) = match raw {
            Some(raw) => (raw, None),
            None => {
                let fetched = self.fetch(descriptor, lookup).await?;
                (fetched.value, fetched.bytes)
            }
        };

        let value = if descriptor.has_processors() {
            tracing::trace!("Processing");
            let start = Instant::now();
            let value = process_chain(descriptor.processors(), raw).await;
            metric!(timer("caches.process") = start.elapsed(), "cache" => &self.name);
            value?
        } else {
            raw
        };

        self.persist(derived_key, &value, bytes.filter(|_| !descriptor.has_processors()));
        Ok(value)
    }

    /// Looks for the raw value under the source `key`, in memory and then on disk.
    async fn raw_get(&self, key: &str) -> Option<T> {
        if let Some(value) = self.memory.get(key) {
            tracing::trace!("Raw memory hit");
            return Some(value);
        }
        let value = self.disk_get(key).await?;
        tracing::trace!("Raw disk hit");
        if self.pipeline.raw_to_memory {
            self.memory.set(key, value.clone());
        }
        Some(value)
    }

    /// Reads `key` from the disk tier on the blocking pool.
    ///
    /// Every failure is treated as a miss, as the value can still be produced otherwise.
    async fn disk_get(&self, key: &str) -> Option<T> {
        let disk = self.disk.clone()?;
        let owned_key = key.to_owned();
        match tokio::task::spawn_blocking(move || disk.get(&owned_key)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) if err.is_miss() => None,
            Ok(Err(err)) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(error = dynerr, "Failed to read `{}` from disk cache", key);
                None
            }
            Err(err) => {
                tracing::error!("Disk cache read for `{}` panicked: {}", key, err);
                None
            }
        }
    }

    /// Joins or starts the fetch for the descriptor's fetcher, and waits for it.
    async fn fetch(
        self: &Arc<Self>,
        descriptor: &Descriptor<T>,
        lookup: &Operation<T>,
    ) -> CacheEntry<FetchResult<T>> {
        let Some(fetcher) = descriptor.fetcher() else {
            tracing::trace!("Nothing cached, and no fetcher");
            return Err(CacheError::NotFound);
        };

        let (operation, is_new) = self.fetches.join(fetcher.identifier());
        let completion = operation.subscribe();
        lookup.depend_on(&operation);

        if is_new {
            let tiers = Arc::clone(self);
            let fetcher = Arc::clone(fetcher);
            let key = descriptor.key().to_owned();
            let persist_raw = descriptor.has_processors();
            let fetch = operation.clone();
            let span = tracing::trace_span!("fetch", identifier = fetcher.identifier());
            let handle = tokio::spawn(
                async move {
                    let canceled = fetch.clone();
                    let _guard = defer(move || canceled.cancel());

                    let result = AssertUnwindSafe(tiers.fetch_raw(fetcher, &key, persist_raw))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(CacheError::processing(format!(
                                "fetch panicked: {}",
                                panic_message(&*panic)
                            )))
                        });
                    fetch.complete(result);
                }
                .instrument(span),
            );
            operation.attach(handle.abort_handle());
        } else {
            tracing::trace!("Joined pending fetch");
        }

        completion.await
    }

    async fn fetch_raw(
        &self,
        fetcher: Arc<dyn Fetcher<T>>,
        key: &str,
        persist_raw: bool,
    ) -> CacheEntry<FetchResult<T>> {
        tracing::trace!("Fetching");
        let start = Instant::now();
        let result = fetcher.fetch().await;
        let status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        metric!(timer("caches.fetch") = start.elapsed(), "cache" => &self.name, "status" => status);
        let fetched = result?;

        if persist_raw {
            if self.pipeline.raw_to_memory {
                self.memory.set(key, fetched.value.clone());
            }
            if self.pipeline.raw_to_disk {
                self.spawn_disk_write(key, &fetched.value, fetched.bytes.clone());
            }
        }

        Ok(fetched)
    }

    /// Puts `value` into memory, and writes it to disk in the background.
    fn persist(&self, key: &str, value: &T, bytes: Option<Bytes>) {
        self.memory.set(key, value.clone());
        self.spawn_disk_write(key, value, bytes);
    }

    /// Writes to disk on the blocking pool, only reporting failures through logs and metrics.
    fn spawn_disk_write(&self, key: &str, value: &T, bytes: Option<Bytes>) {
        let Some(disk) = self.disk.clone() else {
            return;
        };
        let key = key.to_owned();
        let value = value.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = write_to_disk(&disk, &key, &value, bytes) {
                sentry::with_scope(
                    |scope| scope.set_extra("key", key.clone().into()),
                    || {
                        let dynerr: &dyn std::error::Error = &err;
                        tracing::error!(error = dynerr, "Failed to write to disk cache");
                    },
                );
                metric!(counter("caches.file.write_failed") += 1, "cache" => disk.name());
            }
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn write_to_disk<T: 'static>(
    disk: &DiskCache<T>,
    key: &str,
    value: &T,
    bytes: Option<Bytes>,
) -> CacheEntry<()> {
    match bytes {
        Some(bytes) => disk.set_bytes(key, &bytes),
        None => disk.set(key, value),
    }
}

/// A pending [`TieredCache::resolve`].
///
/// Dropping this does not stop the lookup, as other callers might be waiting for it as well. Use
/// [`cancel`](Self::cancel) for that.
#[must_use = "futures do nothing unless polled"]
pub struct Resolve<T> {
    operation: Option<Operation<T>>,
    completion: Completion<T>,
}

impl<T: Clone + Send + 'static> Resolve<T> {
    /// Cancels the lookup.
    ///
    /// Every caller waiting for the same derived key resolves to [`CacheError::Canceled`]. A fetch
    /// is only canceled once no other lookup depends on it. Has no effect once the lookup
    /// completed.
    pub fn cancel(&self) {
        if let Some(operation) = &self.operation {
            operation.cancel();
        }
    }
}

impl<T> fmt::Debug for Resolve<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolve")
            .field("pending", &self.operation.is_some())
            .finish()
    }
}

impl<T> Future for Resolve<T> {
    type Output = CacheEntry<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion).poll(cx)
    }
}

enum WriteState {
    Done(Option<CacheEntry<()>>),
    Pending(JoinHandle<CacheEntry<()>>),
}

/// A disk write started by [`TieredCache::put`].
#[must_use = "futures do nothing unless polled"]
pub struct WriteHandle {
    state: WriteState,
}

impl WriteHandle {
    fn done(result: CacheEntry<()>) -> Self {
        Self {
            state: WriteState::Done(Some(result)),
        }
    }
}

impl fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = matches!(self.state, WriteState::Pending(_));
        f.debug_struct("WriteHandle")
            .field("pending", &pending)
            .finish()
    }
}

impl Future for WriteHandle {
    type Output = CacheEntry<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            WriteState::Done(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            WriteState::Pending(handle) => Pin::new(handle).poll(cx).map(|result| {
                result.unwrap_or_else(|err| {
                    if err.is_cancelled() {
                        Err(CacheError::Canceled)
                    } else {
                        Err(CacheError::Io(format!("disk write panicked: {err}")))
                    }
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A lookup that started after another one finished is served from memory.
    #[tokio::test]
    async fn test_lookup_rechecks_memory() {
        let memory = MemoryCache::new("strings", &Default::default());
        let cache = TieredCache::new("strings", memory, None, PipelineConfig::default());

        let (operation, is_new) = cache.inner.lookups.register("X");
        assert!(is_new);
        cache.put("X", "cached".to_owned()).await.unwrap();

        // without a fetcher, anything but a memory hit is `NotFound`
        let descriptor = Descriptor::new("X");
        assert_eq!(
            cache.inner.lookup(&descriptor, &operation).await,
            Ok("cached".to_owned())
        );
    }
}
