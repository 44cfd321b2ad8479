//! In-memory LRU image cache implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::domain::entities::{Image, ImageId};
use crate::domain::ports::ImageCachePort;

struct CacheEntry {
    image: Arc<Image>,
    cost: usize,
}

struct CacheState {
    entries: LruCache<ImageId, CacheEntry>,
    count_limit: usize,
    total_cost_limit: usize,
    total_cost: usize,
}

impl CacheState {
    fn over_budget(&self) -> bool {
        let over_count = self.count_limit > 0 && self.entries.len() > self.count_limit;
        // The most recent entry is kept even if it alone exceeds the cost limit.
        let over_cost = self.total_cost_limit > 0
            && self.total_cost > self.total_cost_limit
            && self.entries.len() > 1;
        over_count || over_cost
    }

    fn pop_lru(&mut self) -> Option<ImageId> {
        let (id, entry) = self.entries.pop_lru()?;
        self.total_cost = self.total_cost.saturating_sub(entry.cost);
        Some(id)
    }

    fn evict_to_budget(&mut self) -> usize {
        let mut evicted = 0;
        while self.over_budget() {
            if self.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }
}

/// Bounded in-memory cache for decoded images.
///
/// Bounded by entry count and by total cost (0 means unlimited for
/// either). Evicts least-recently-used entries on insert and when a
/// [`MemoryPressureSignal`] fires.
pub struct MemoryImageCache {
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a cache with the given count and cost limits.
    #[must_use]
    pub fn new(count_limit: usize, total_cost_limit: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                count_limit,
                total_cost_limit,
                total_cost: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates a cache with no limits.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(0, 0)
    }

    /// Returns the maximum number of entries, 0 if unlimited.
    #[must_use]
    pub fn count_limit(&self) -> usize {
        self.state.lock().count_limit
    }

    /// Sets the maximum number of entries and evicts down to it.
    pub fn set_count_limit(&self, count_limit: usize) {
        let mut state = self.state.lock();
        state.count_limit = count_limit;
        let evicted = state.evict_to_budget();
        debug!(count_limit, evicted, "Updated image cache count limit");
    }

    /// Returns the maximum total cost, 0 if unlimited.
    #[must_use]
    pub fn total_cost_limit(&self) -> usize {
        self.state.lock().total_cost_limit
    }

    /// Sets the maximum total cost and evicts down to it.
    pub fn set_total_cost_limit(&self, total_cost_limit: usize) {
        let mut state = self.state.lock();
        state.total_cost_limit = total_cost_limit;
        let evicted = state.evict_to_budget();
        debug!(total_cost_limit, evicted, "Updated image cache cost limit");
    }

    /// Returns the summed cost of every cached entry.
    #[must_use]
    pub fn total_cost(&self) -> usize {
        self.state.lock().total_cost
    }

    /// Peeks at an image without promoting it in the LRU.
    #[must_use]
    pub fn peek(&self, id: &ImageId) -> Option<Arc<Image>> {
        self.state.lock().entries.peek(id).map(|e| e.image.clone())
    }

    /// Returns true if `id` is cached. Does not count as a hit or miss.
    #[must_use]
    pub fn contains(&self, id: &ImageId) -> bool {
        self.state.lock().entries.contains(id)
    }

    /// Drops the least recently used half of the entries.
    pub fn handle_memory_pressure(&self) {
        let mut state = self.state.lock();
        let keep = state.entries.len() / 2;
        let mut evicted = 0;
        while state.entries.len() > keep {
            if state.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        debug!(evicted, remaining = keep, "Evicted images under memory pressure");
    }

    /// Evicts under pressure every time `signal` is raised.
    ///
    /// The listener stops when the cache or the signal is dropped.
    pub fn watch_memory_pressure(
        self: &Arc<Self>,
        signal: &MemoryPressureSignal,
    ) -> tokio::task::JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let mut rx = signal.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.handle_memory_pressure();
            }
            trace!("Memory pressure listener stopped");
        })
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let state = self.state.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: state.entries.len(),
            total_cost: state.total_cost,
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl std::fmt::Debug for MemoryImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImageCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ImageCachePort for MemoryImageCache {
    fn get(&self, id: &ImageId) -> Option<Arc<Image>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(id = %id, "Memory cache hit");
            Some(entry.image.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(id = %id, "Memory cache miss");
            None
        }
    }

    fn set(&self, id: ImageId, image: Arc<Image>, cost: usize) {
        let mut state = self.state.lock();
        debug!(id = %id, cost, "Storing image in memory cache");
        if let Some(old) = state.entries.put(id, CacheEntry { image, cost }) {
            state.total_cost = state.total_cost.saturating_sub(old.cost);
        }
        state.total_cost += cost;
        let evicted = state.evict_to_budget();
        if evicted > 0 {
            trace!(evicted, "Evicted images over budget");
        }
    }

    fn remove(&self, id: &ImageId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.pop(id) {
            state.total_cost = state.total_cost.saturating_sub(entry.cost);
            debug!(id = %id, "Removed image from memory cache");
        }
    }

    fn remove_all(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_cost = 0;
        debug!("Cleared memory image cache");
    }

    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Summed cost of cached images.
    pub total_cost: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images ({} cost), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.total_cost, self.hit_rate, self.hits, self.misses
        )
    }
}

/// Opaque trigger asking caches to shed memory.
#[derive(Debug, Clone)]
pub struct MemoryPressureSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl MemoryPressureSignal {
    /// Creates a signal with no listeners.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Notifies every subscribed cache.
    pub fn raise(&self) {
        self.tx.send_modify(|count| *count += 1);
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for MemoryPressureSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn image() -> Arc<Image> {
        Arc::new(Image::new_rgb8(10, 10))
    }

    #[test]
    fn test_cache_set_and_get() {
        let cache = MemoryImageCache::new(10, 0);
        let id = ImageId::new("test1");
        let img = Arc::new(Image::new_rgb8(100, 100));

        cache.set(id.clone(), img, 1);
        let retrieved = cache.get(&id);

        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().width(), 100);
    }

    #[test]
    fn test_cache_miss() {
        let cache = MemoryImageCache::unbounded();
        assert!(cache.get(&ImageId::new("nonexistent")).is_none());
    }

    #[test]
    fn test_count_eviction() {
        let cache = MemoryImageCache::new(2, 0);

        let id1 = ImageId::new("test1");
        let id2 = ImageId::new("test2");
        let id3 = ImageId::new("test3");

        cache.set(id1.clone(), image(), 1);
        cache.set(id2.clone(), image(), 1);
        cache.set(id3.clone(), image(), 1);

        // id1 should be evicted (LRU)
        assert!(cache.get(&id1).is_none());
        assert!(cache.get(&id2).is_some());
        assert!(cache.get(&id3).is_some());
    }

    #[test]
    fn test_cost_eviction() {
        let cache = MemoryImageCache::new(0, 100);

        cache.set(ImageId::new("a"), image(), 60);
        cache.set(ImageId::new("b"), image(), 30);
        assert_eq!(cache.total_cost(), 90);

        cache.set(ImageId::new("c"), image(), 50);

        assert!(!cache.contains(&ImageId::new("a")));
        assert!(cache.contains(&ImageId::new("b")));
        assert!(cache.contains(&ImageId::new("c")));
        assert_eq!(cache.total_cost(), 80);
    }

    #[test]
    fn test_oversized_entry_is_kept_alone() {
        let cache = MemoryImageCache::new(0, 10);
        cache.set(ImageId::new("small"), image(), 5);
        cache.set(ImageId::new("huge"), image(), 50);

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&ImageId::new("huge")));
    }

    #[test]
    fn test_replacing_entry_updates_cost() {
        let cache = MemoryImageCache::unbounded();
        let id = ImageId::new("a");
        cache.set(id.clone(), image(), 40);
        cache.set(id.clone(), image(), 10);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 10);

        cache.remove(&id);
        assert_eq!(cache.total_cost(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lowering_count_limit_evicts() {
        let cache = MemoryImageCache::unbounded();
        for i in 0..5 {
            cache.set(ImageId::new(format!("img{i}")), image(), 1);
        }

        cache.set_count_limit(2);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&ImageId::new("img4")));
        assert!(cache.contains(&ImageId::new("img3")));
    }

    #[test]
    fn test_remove_all() {
        let cache = MemoryImageCache::unbounded();
        cache.set(ImageId::new("a"), image(), 3);
        cache.set(ImageId::new("b"), image(), 4);

        cache.remove_all();

        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_cache_stats() {
        let cache = MemoryImageCache::unbounded();
        let id = ImageId::new("test1");
        cache.set(id.clone(), image(), 7);

        // Hit
        let _ = cache.get(&id);
        // Miss
        let _ = cache.get(&ImageId::new("missing"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.total_cost, 7);
    }

    #[test]
    fn test_peek_does_not_promote() {
        let cache = MemoryImageCache::new(2, 0);

        let id1 = ImageId::new("test1");
        let id2 = ImageId::new("test2");

        cache.set(id1.clone(), image(), 1);
        cache.set(id2.clone(), image(), 1);

        // Peek at id1 (should not promote it)
        let _ = cache.peek(&id1);

        cache.set(ImageId::new("test3"), image(), 1);

        assert!(cache.peek(&id1).is_none());
    }

    #[test]
    fn test_memory_pressure_halves_entries() {
        let cache = MemoryImageCache::unbounded();
        for i in 0..6 {
            cache.set(ImageId::new(format!("img{i}")), image(), 1);
        }

        cache.handle_memory_pressure();

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&ImageId::new("img5")));
        assert!(!cache.contains(&ImageId::new("img0")));
    }

    #[tokio::test]
    async fn test_pressure_signal_triggers_eviction() {
        let cache = Arc::new(MemoryImageCache::unbounded());
        let signal = MemoryPressureSignal::new();
        let listener = cache.watch_memory_pressure(&signal);

        for i in 0..4 {
            cache.set(ImageId::new(format!("img{i}")), image(), 1);
        }
        signal.raise();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while cache.len() != 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.len(), 2);

        drop(signal);
        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .expect("listener should stop when signal is dropped")
            .unwrap();
    }
}
