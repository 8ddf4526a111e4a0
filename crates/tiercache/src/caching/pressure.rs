use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::MemoryCache;

/// Something that can drop all of its contents on demand.
trait Clear: Send + Sync {
    fn clear(&self);
}

impl<T> Clear for moka::sync::Cache<String, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clear(&self) {
        self.invalidate_all();
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, Weak<dyn Clear>)>,
}

/// Delivers memory-pressure signals to memory tiers.
///
/// The hub only holds weak references, so it never keeps a tier alive. A tier is subscribed with
/// [`MemoryPressure::subscribe`], and deregistered when the returned [`PressureSubscription`] is
/// dropped.
#[derive(Clone, Default)]
pub struct MemoryPressure {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl std::fmt::Debug for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressure")
            .field("subscribers", &self.subscribers.lock().entries.len())
            .finish()
    }
}

impl MemoryPressure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `cache` to be cleared on every [`notify`](Self::notify).
    #[must_use = "the cache is deregistered when the subscription is dropped"]
    pub fn subscribe<T>(&self, cache: &MemoryCache<T>) -> PressureSubscription
    where
        T: Clone + Send + Sync + 'static,
    {
        let weak: Weak<dyn Clear> = Arc::downgrade(&cache.cache) as Weak<dyn Clear>;

        let mut subscribers = self.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.entries.push((id, weak));

        PressureSubscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Clears every subscribed memory tier that is still alive.
    ///
    /// Returns the number of tiers that were cleared.
    pub fn notify(&self) -> usize {
        let live: Vec<_> = {
            let mut subscribers = self.subscribers.lock();
            subscribers
                .entries
                .retain(|(_, weak)| weak.strong_count() > 0);
            subscribers
                .entries
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };

        tracing::info!("Memory pressure, clearing {} memory caches", live.len());
        metric!(counter("caches.memory.pressure") += 1);

        for cache in &live {
            cache.clear();
        }
        live.len()
    }
}

/// Keeps a memory tier registered with a [`MemoryPressure`] hub.
#[derive(Debug)]
pub struct PressureSubscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Drop for PressureSubscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::InMemoryCacheConfig;

    use super::*;

    #[test]
    fn test_notify_clears_subscribers() {
        let pressure = MemoryPressure::new();
        let config = InMemoryCacheConfig::default();
        let first = MemoryCache::new("first", &config);
        let second = MemoryCache::new("second", &config);

        let _first_sub = pressure.subscribe(&first);
        let second_sub = pressure.subscribe(&second);

        first.set("a", 1u8);
        second.set("a", 2u16);

        assert_eq!(pressure.notify(), 2);
        assert_eq!(first.get("a"), None);
        assert_eq!(second.get("a"), None);

        drop(second_sub);
        second.set("a", 3u16);
        assert_eq!(pressure.notify(), 1);
        assert_eq!(second.get("a"), Some(3));
    }

    #[test]
    fn test_does_not_keep_caches_alive() {
        let pressure = MemoryPressure::new();
        let cache = MemoryCache::new("dropped", &InMemoryCacheConfig::default());
        let subscription = pressure.subscribe(&cache);
        cache.set("a", 1u8);

        drop(cache);
        assert_eq!(pressure.notify(), 0);

        // deregistering after the hub pruned the entry is fine
        drop(subscription);
        drop(pressure);
    }
}
