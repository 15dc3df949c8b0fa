//! Bounded local store backing a near-cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

use rand::seq::IteratorRandom;

use super::{EvictionPolicy, NearCacheConfig};

/// Statistics for near-cache operations.
#[derive(Debug, Clone, Default)]
pub struct NearCacheStats {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
}

impl NearCacheStats {
    /// Returns the number of cache hits.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Returns the number of cache misses.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Returns the number of entries evicted due to capacity.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Returns the number of entries expired due to TTL or max-idle.
    pub fn expirations(&self) -> u64 {
        self.expirations
    }

    /// Returns the number of entries dropped because of a remote change.
    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }

    /// Returns the hit ratio (hits / total lookups).
    ///
    /// Returns `0.0` if no lookups have been performed.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 1,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

fn is_expired<V>(config: &NearCacheConfig, entry: &CacheEntry<V>, now: Instant) -> bool {
    let ttl = config.time_to_live();
    let max_idle = config.max_idle();

    // Zero means infinite for both settings.
    if !ttl.is_zero() && now.duration_since(entry.created_at) > ttl {
        return true;
    }
    !max_idle.is_zero() && now.duration_since(entry.last_accessed) > max_idle
}

/// A bounded map with TTL, max-idle and eviction.
///
/// Not synchronized; `InvalidatedNearCache` wraps it for concurrent use.
pub struct NearCache<K, V> {
    config: NearCacheConfig,
    store: HashMap<K, CacheEntry<V>>,
    stats: NearCacheStats,
}

impl<K, V> std::fmt::Debug for NearCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearCache")
            .field("config", &self.config)
            .field("store_size", &self.store.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<K, V> NearCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a new near-cache with the given configuration.
    pub fn new(config: NearCacheConfig) -> Self {
        Self {
            config,
            store: HashMap::new(),
            stats: NearCacheStats::default(),
        }
    }

    /// Returns a clone of the cached value if present and not expired.
    ///
    /// Updates access statistics and touch time for LRU/LFU tracking.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        let expired = match self.store.get(key) {
            None => {
                self.stats.misses += 1;
                return None;
            }
            Some(entry) => is_expired(&self.config, entry, now),
        };

        if expired {
            self.store.remove(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }

        let entry = self.store.get_mut(key)?;
        entry.touch(now);
        self.stats.hits += 1;
        Some(entry.value.clone())
    }

    /// Inserts a value into the cache.
    ///
    /// If the cache is at capacity, an entry is evicted according to the
    /// configured eviction policy. With `EvictionPolicy::None` a full cache
    /// rejects new keys.
    ///
    /// Returns `true` if the entry was inserted, `false` if rejected.
    pub fn put(&mut self, key: K, value: V) -> bool {
        let now = Instant::now();
        self.remove_expired_entries(now);

        let full = self.store.len() >= self.config.max_size() as usize;
        if full && !self.store.contains_key(&key) && !self.evict_one() {
            return false;
        }

        self.store.insert(key, CacheEntry::new(value, now));
        true
    }

    /// Drops an entry because the server reported a change.
    ///
    /// Returns `true` if the key was cached.
    pub fn invalidate(&mut self, key: &K) -> bool {
        let removed = self.store.remove(key).is_some();
        if removed {
            self.stats.invalidations += 1;
        }
        removed
    }

    /// Removes all entries from the cache.
    pub fn clear(&mut self) {
        self.store.clear();
    }

    /// Returns whether the key is cached, ignoring expiration.
    pub fn contains_key(&self, key: &K) -> bool {
        self.store.contains_key(key)
    }

    /// Returns the cached keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.store.keys()
    }

    /// Returns the number of entries in the cache.
    pub fn size(&self) -> usize {
        self.store.len()
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> NearCacheStats {
        self.stats.clone()
    }

    /// Returns a reference to the cache configuration.
    pub fn config(&self) -> &NearCacheConfig {
        &self.config
    }

    fn remove_expired_entries(&mut self, now: Instant) {
        let before = self.store.len();
        let config = &self.config;
        self.store.retain(|_, entry| !is_expired(config, entry, now));
        self.stats.expirations += (before - self.store.len()) as u64;
    }

    fn evict_one(&mut self) -> bool {
        let victim = match self.config.eviction_policy() {
            EvictionPolicy::Lru => self
                .store
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => self
                .store
                .iter()
                .min_by_key(|(_, entry)| entry.access_count)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Random => self.store.keys().choose(&mut rand::thread_rng()).cloned(),
            EvictionPolicy::None => None,
        };

        match victim {
            Some(key) => {
                self.store.remove(&key);
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }
}
