use std::sync::Arc;

use crate::config::InMemoryCacheConfig;

type InMemoryCache<T> = moka::sync::Cache<String, T>;

/// The volatile tier.
///
/// A [`moka`] cache bounded by a weighted byte budget ([`InMemoryCacheConfig::capacity`]), with an
/// optional time-to-idle. Retention is best effort: entries can be evicted at any time, and the
/// whole tier is emptied when a memory-pressure signal is delivered through
/// [`MemoryPressure`](super::MemoryPressure). Nothing else relies on an entry staying here.
pub struct MemoryCache<T> {
    name: String,
    pub(super) cache: Arc<InMemoryCache<T>>,
}

impl<T> std::fmt::Debug for MemoryCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("name", &self.name)
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl<T> Clone for MemoryCache<T> {
    fn clone(&self) -> Self {
        MemoryCache {
            name: self.name.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> MemoryCache<T> {
    /// Creates a tier that weighs values by their shallow size.
    ///
    /// Heap data owned by a value is not counted, so for `String`, `Vec` or `Arc` backed values
    /// the capacity acts as an approximate entry count. Use [`with_weigher`](Self::with_weigher)
    /// to account for the real size.
    pub fn new(name: &str, config: &InMemoryCacheConfig) -> Self {
        Self::with_weigher(name, config, |value| std::mem::size_of_val(value) as u32)
    }

    /// Creates a tier that weighs values with `weigher`.
    ///
    /// The weight should approximate the bytes held by a value, as it is counted against
    /// [`InMemoryCacheConfig::capacity`].
    pub fn with_weigher<W>(name: &str, config: &InMemoryCacheConfig, weigher: W) -> Self
    where
        W: Fn(&T) -> u32 + Send + Sync + 'static,
    {
        let mut builder = InMemoryCache::builder()
            .max_capacity(config.capacity)
            .name(name)
            // NOTE: we count the key and its bookkeeping to the weight as well
            .weigher(move |key: &String, value: &T| {
                let key_size = (std::mem::size_of::<String>() + key.len()) as u32;
                key_size.saturating_add(weigher(value))
            });
        if let Some(time_to_idle) = config.time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }

        MemoryCache {
            name: name.to_owned(),
            cache: Arc::new(builder.build()),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let value = self.cache.get(key);
        if value.is_some() {
            metric!(counter("caches.memory.hit") += 1, "cache" => &self.name);
        }
        value
    }

    pub fn set(&self, key: &str, value: T) {
        self.cache.insert(key.to_owned(), value);
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn clear(&self) {
        tracing::debug!("Clearing `{}` memory cache", self.name);
        self.cache.invalidate_all();
    }

    /// An approximate number of entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(capacity: u64) -> InMemoryCacheConfig {
        InMemoryCacheConfig {
            capacity,
            time_to_idle: None,
        }
    }

    #[test]
    fn test_get_set_remove() {
        let cache = MemoryCache::new("test", &config(1024 * 1024));

        assert_eq!(cache.get("a"), None);
        cache.set("a", 1u32);
        cache.set("b", 2u32);
        assert_eq!(cache.get("a"), Some(1));

        cache.set("a", 3u32);
        assert_eq!(cache.get("a"), Some(3));

        cache.remove("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));

        cache.clear();
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = MemoryCache::new("test", &config(1024 * 1024));
        let other = cache.clone();

        cache.set("a", String::from("vanilla"));
        assert_eq!(other.get("a").as_deref(), Some("vanilla"));
    }

    #[test]
    fn test_weighted_capacity() {
        let cache = MemoryCache::with_weigher("test", &config(10 * 1024), |v: &Vec<u8>| {
            v.len() as u32
        });

        for i in 0..100 {
            cache.set(&i.to_string(), vec![0; 1024]);
        }
        cache.cache.run_pending_tasks();

        assert!(cache.cache.weighted_size() <= 10 * 1024);
        assert!(cache.entry_count() < 100);
    }

    #[test]
    fn test_time_to_idle() {
        let cache = MemoryCache::new(
            "test",
            &InMemoryCacheConfig {
                capacity: 1024,
                time_to_idle: Some(Duration::from_millis(20)),
            },
        );

        cache.set("a", 1u8);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("a"), None);
    }
}
