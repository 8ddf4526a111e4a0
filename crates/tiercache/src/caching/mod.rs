//! # Tiered caching
//!
//! This module caches values that are slow to produce, like downloads and the artifacts derived
//! from them, in two tiers: a volatile in-memory tier and a persistent file-system tier.
//!
//! ## Cache Layers
//!
//! - The [`MemoryCache`] is a bounded `moka` cache. It is best effort, and can be emptied at any
//!   time, for example through [`MemoryPressure`].
//! - The [`DiskCache`] stores one file per key, and evicts the least recently used files once it
//!   grows beyond its capacity.
//!
//! A lookup, described by a [`Descriptor`], goes through the following steps:
//! - First, it goes through the memory tier.
//! - If the same derived key is already being looked up, it waits for that lookup instead.
//! - On miss, it will try to load the derived value from disk.
//! - On miss, it looks for the raw value under the source key, if the descriptor has processors.
//! - On miss, it will fetch the raw value through the [`Fetcher`]. Lookups sharing a fetcher
//!   identifier share that fetch.
//! - The raw value is run through the [`Processor`] chain.
//! - The final value is stored in memory, and written to disk in the background.
//!
//! ### Metrics
//!
//! Most metrics are tagged with a `cache` field that corresponds to the cache name:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the memory tier.
//! - `caches.file.hit` / `caches.file.miss`: Reads of the disk tier.
//! - `caches.coalesced`: Lookups and fetches joining one that is already in flight.
//! - `caches.fetch`: A timer for every fetch.
//! - `caches.process`: A timer for every run of a processor chain.
//! - `caches.file.write` and `caches.file.size`: Files written to disk, and their size.
//! - `caches.eviction.files` and `caches.eviction.bytes`: What eviction removed.
//! - `caches.size.bytes`: The size of the disk tier after opening, eviction or cleanup.
//!
//! ### Configuration
//!
//! Coalescing and the memory tier are always active. The disk tier is gated by the
//! [`Config::cache_dir`](crate::config::Config::cache_dir) option, without it values are only kept
//! in memory. Entries unused for `max_unused_for` are only removed by an explicit
//! [`DiskCache::cleanup`], as run by the `tiercache cleanup` command.

mod cache_error;
mod cache_key;
mod cacher;
mod cleanup;
mod coalesce;
mod descriptor;
mod fs;
mod memory;
mod pressure;

pub use cache_error::{CacheEntry, CacheError, FetchError};
pub use cache_key::{derived_key, file_name};
pub use cacher::{CacheStats, Resolve, TieredCache, WriteHandle};
pub use cleanup::CleanupStats;
pub use coalesce::{Completion, Operation, Registry, SubOperation};
pub use descriptor::{
    BytesSerializer, Descriptor, FetchResult, Fetcher, JsonSerializer, Processor, Serializer,
};
pub use fs::{DiskCache, TMP_DIR};
pub use memory::MemoryCache;
pub use pressure::{MemoryPressure, PressureSubscription};
