//! In-memory caches for metadata records
//!
//! - [`ArcCache`]: Adaptive Replacement Cache for decoded records
//! - [`RefCounts`]: bounded map of per-blob reference counters
//!
//! ARC combines recency and frequency to make eviction decisions,
//! automatically adapting to workload patterns. It maintains:
//!
//! - T1: Recently accessed entries (seen once recently)
//! - T2: Frequently accessed entries (seen multiple times)
//! - B1: Ghost entries recently evicted from T1
//! - B2: Ghost entries recently evicted from T2

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// ARC cache internal state
///
/// The four lists are unbounded `LruCache`s used as ordered sets; the ARC
/// bookkeeping below keeps their combined size within `2 * capacity`.
struct ArcState<K: Hash + Eq, V> {
    t1: LruCache<K, V>,
    t2: LruCache<K, V>,
    b1: LruCache<K, ()>,
    b2: LruCache<K, ()>,
    /// Target size for T1 (adaptive parameter)
    p: usize,
    capacity: usize,
}

impl<K: Hash + Eq, V> ArcState<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            t1: LruCache::unbounded(),
            t2: LruCache::unbounded(),
            b1: LruCache::unbounded(),
            b2: LruCache::unbounded(),
            p: 0,
            capacity,
        }
    }

    fn cache_size(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn ghost_size(&self) -> usize {
        self.b1.len() + self.b2.len()
    }

    /// Evict one resident entry into the matching ghost list
    fn replace(&mut self, in_b2: bool) -> bool {
        let t1_len = self.t1.len();
        let evict_from_t1 = t1_len > 0 && (t1_len > self.p || (in_b2 && t1_len == self.p));
        if evict_from_t1 || self.t2.is_empty() {
            if let Some((key, _)) = self.t1.pop_lru() {
                self.b1.put(key, ());
                return true;
            }
        } else if let Some((key, _)) = self.t2.pop_lru() {
            self.b2.put(key, ());
            return true;
        }
        false
    }
}

/// Adaptive Replacement Cache
pub struct ArcCache<K: Hash + Eq, V> {
    state: Mutex<ArcState<K, V>>,
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V: Clone> ArcCache<K, V> {
    /// Create a new ARC cache with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArcState::new(capacity.max(1))),
            stats: CacheStats::default(),
        }
    }

    /// Get a value from the cache
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();

        // A second hit promotes the entry from T1 to T2
        if let Some(value) = state.t1.pop(key) {
            state.t2.put(key.clone(), value.clone());
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(value) = state.t2.get(key) {
            let value = value.clone();
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Put a value into the cache
    pub fn put(&self, key: K, value: V) {
        let mut state = self.state.lock();
        let capacity = state.capacity;

        // Case 1: resident (update value and move to T2)
        if state.t1.pop(&key).is_some() || state.t2.contains(&key) {
            state.t2.put(key, value);
            return;
        }

        // Case 2: ghost hit in B1 (recency is paying off, grow T1's target)
        if state.b1.contains(&key) {
            let delta = (state.b2.len() / state.b1.len()).max(1);
            state.p = (state.p + delta).min(capacity);
            state.b1.pop(&key);
            if state.cache_size() >= capacity && state.replace(false) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            state.t2.put(key, value);
            return;
        }

        // Case 3: ghost hit in B2 (frequency is paying off, shrink T1's target)
        if state.b2.contains(&key) {
            let delta = (state.b1.len() / state.b2.len()).max(1);
            state.p = state.p.saturating_sub(delta);
            state.b2.pop(&key);
            if state.cache_size() >= capacity && state.replace(true) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            state.t2.put(key, value);
            return;
        }

        // Case 4: new entry
        let l1_size = state.t1.len() + state.b1.len();
        if l1_size >= capacity {
            if state.t1.len() < capacity {
                state.b1.pop_lru();
                if state.replace(false) {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            } else if state.t1.pop_lru().is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        } else if state.cache_size() + state.ghost_size() >= capacity {
            if state.cache_size() + state.ghost_size() >= 2 * capacity {
                state.b2.pop_lru();
            }
            if state.cache_size() >= capacity && state.replace(false) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        state.t1.put(key, value);
    }

    /// Remove a value from the cache
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        state.b1.pop(key);
        state.b2.pop(key);
        state.t1.pop(key).or_else(|| state.t2.pop(key))
    }

    /// Check if key is in cache
    pub fn contains(&self, key: &K) -> bool {
        let state = self.state.lock();
        state.t1.contains(key) || state.t2.contains(key)
    }

    /// Clear the entire cache
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.t1.clear();
        state.t2.clear();
        state.b1.clear();
        state.b2.clear();
        state.p = 0;
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.state.lock().cache_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Bounded map of per-blob reference counters
///
/// Counters are seeded from the persisted refcount on first use and then
/// adjusted in memory, so repeated appends of hot content do not decode the
/// stored record to learn the current count. The least recently used counter
/// is evicted once `capacity` is reached; an evicted counter is simply
/// re-seeded from the store next time.
///
/// Callers must hold the blob's stripe lock while they read-modify-write a
/// counter and must [`invalidate`](Self::invalidate) it if the metadata
/// commit that was meant to persist the new value fails.
pub struct RefCounts<K: Hash + Eq> {
    counters: Mutex<LruCache<K, Arc<AtomicI64>>>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone> RefCounts<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            counters: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
        }
    }

    /// Counter for `key`, seeded with `seed()` when absent
    pub fn counter(&self, key: &K, seed: impl FnOnce() -> i64) -> Arc<AtomicI64> {
        let mut counters = self.counters.lock();
        if let Some(counter) = counters.get(key) {
            return Arc::clone(counter);
        }
        while counters.len() >= self.capacity {
            counters.pop_lru();
        }
        let counter = Arc::new(AtomicI64::new(seed()));
        counters.put(key.clone(), Arc::clone(&counter));
        counter
    }

    /// Forget the in-memory value; the next use re-seeds from the store
    pub fn invalidate(&self, key: &K) {
        self.counters.lock().pop(key);
    }

    /// Forget every counter
    pub fn clear(&self) {
        self.counters.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
