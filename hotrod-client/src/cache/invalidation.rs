//! Thread-safe near-cache kept coherent by server push events.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use hotrod_core::protocol::VersionedValue;
use hotrod_core::Result;

use super::{BloomFilter, NearCache, NearCacheConfig, NearCacheStats};

/// Ticket taken on a near-cache miss.
///
/// The value fetched from the server is only installed if no invalidation,
/// clear or newer reservation for the same key happened in between.
#[derive(Debug)]
#[must_use = "a reservation must be completed or cancelled"]
pub struct Reservation {
    key: Bytes,
    id: u64,
    bloom_generation: Option<u64>,
}

impl Reservation {
    /// Returns the reserved key.
    pub fn key(&self) -> &Bytes {
        &self.key
    }
}

#[derive(Debug)]
struct BloomState {
    filter: BloomFilter,
    generation: u64,
    shipped: u64,
    removed_since_rebuild: u64,
}

#[derive(Debug)]
struct State {
    store: NearCache<Bytes, VersionedValue>,
    reservations: HashMap<Bytes, u64>,
    next_reservation: u64,
    bloom: Option<BloomState>,
}

/// A near-cache shared between callers and the listener that invalidates it.
///
/// Entries are dropped, never patched, when an event arrives for their key.
/// While the listener is being re-registered the cache is stale: reads miss
/// and fetched values are not installed.
#[derive(Debug)]
pub struct InvalidatedNearCache {
    config: NearCacheConfig,
    state: Mutex<State>,
    stale: AtomicBool,
    ship_lock: tokio::sync::Mutex<()>,
}

impl InvalidatedNearCache {
    /// Creates a near-cache. `bloom` enables the bloom filter summary.
    pub fn new(config: NearCacheConfig, bloom: bool) -> Self {
        let bloom = bloom.then(|| BloomState {
            filter: BloomFilter::new(config.bloom_bits()),
            generation: 0,
            shipped: 0,
            removed_since_rebuild: 0,
        });
        Self {
            state: Mutex::new(State {
                store: NearCache::new(config.clone()),
                reservations: HashMap::new(),
                next_reservation: 0,
                bloom,
            }),
            config,
            stale: AtomicBool::new(false),
            ship_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &NearCacheConfig {
        &self.config
    }

    /// Returns whether a bloom filter is maintained.
    pub fn uses_bloom_filter(&self) -> bool {
        self.lock().bloom.is_some()
    }

    /// Looks a key up.
    pub fn get(&self, key: &Bytes) -> Option<VersionedValue> {
        if self.is_stale() {
            return None;
        }
        self.lock().store.get(key)
    }

    /// Takes a reservation for a key about to be read from the server.
    ///
    /// With a bloom filter the key is added to it here, so the server learns
    /// about the key before the read it is guarding.
    pub fn reserve(&self, key: Bytes) -> Reservation {
        let mut state = self.lock();
        state.next_reservation += 1;
        let id = state.next_reservation;
        state.reservations.insert(key.clone(), id);

        let bloom_generation = state.bloom.as_mut().map(|bloom| {
            if !bloom.filter.might_contain(&key) {
                bloom.filter.insert(&key);
                bloom.generation += 1;
            }
            bloom.generation
        });

        Reservation {
            key,
            id,
            bloom_generation,
        }
    }

    /// Returns whether the filter covering `reservation` still has to be shipped.
    pub fn needs_shipping(&self, reservation: &Reservation) -> bool {
        match (reservation.bloom_generation, self.lock().bloom.as_ref()) {
            (Some(generation), Some(bloom)) => bloom.shipped < generation,
            _ => false,
        }
    }

    /// Installs the value read for `reservation` unless it was invalidated.
    ///
    /// Returns `true` if the value was cached.
    pub fn complete(&self, reservation: Reservation, value: Option<VersionedValue>) -> bool {
        let mut state = self.lock();
        if state.reservations.get(&reservation.key) != Some(&reservation.id) {
            return false;
        }
        state.reservations.remove(&reservation.key);

        match value {
            Some(value) if !self.is_stale() => state.store.put(reservation.key, value),
            _ => false,
        }
    }

    /// Drops a reservation without installing anything.
    pub fn cancel(&self, reservation: Reservation) {
        let mut state = self.lock();
        if state.reservations.get(&reservation.key) == Some(&reservation.id) {
            state.reservations.remove(&reservation.key);
        }
    }

    /// Drops a key after a remote or local change.
    ///
    /// Also voids any reservation in flight for the key.
    pub fn invalidate(&self, key: &Bytes) {
        let mut state = self.lock();
        state.reservations.remove(key);
        let removed = state.store.invalidate(key);
        if removed {
            if let Some(bloom) = state.bloom.as_mut() {
                bloom.removed_since_rebuild += 1;
            }
            self.maybe_rebuild(&mut state);
        }
    }

    /// Drops every entry and reservation.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.store.clear();
        state.reservations.clear();
        if let Some(bloom) = state.bloom.as_mut() {
            bloom.filter.clear();
            bloom.generation += 1;
            bloom.removed_since_rebuild = 0;
        }
    }

    /// Clears the cache and stops serving from it until `mark_fresh`.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
        self.clear();
    }

    /// Resumes serving after the listener is registered again.
    pub fn mark_fresh(&self) {
        self.stale.store(false, Ordering::SeqCst);
    }

    /// Returns whether the cache is currently bypassed.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Ships the current filter through `send` unless a filter at least as
    /// new as `required` already went out.
    ///
    /// Shipments are serialized, so an older filter never overwrites a newer
    /// one on the server.
    pub async fn ship_bloom<F, Fut>(&self, required: u64, send: F) -> Result<()>
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.ship_lock.lock().await;
        let snapshot = {
            let state = self.lock();
            match state.bloom.as_ref() {
                Some(bloom) if bloom.shipped < required => {
                    Some((bloom.generation, bloom.filter.to_bytes()))
                }
                _ => None,
            }
        };

        let Some((generation, bits)) = snapshot else {
            return Ok(());
        };
        send(bits).await?;

        if let Some(bloom) = self.lock().bloom.as_mut() {
            bloom.shipped = bloom.shipped.max(generation);
        }
        tracing::trace!(generation, "bloom filter shipped");
        Ok(())
    }

    /// Ships whatever filter covers `reservation`.
    pub async fn ship_for<F, Fut>(&self, reservation: &Reservation, send: F) -> Result<()>
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match reservation.bloom_generation {
            Some(required) => self.ship_bloom(required, send).await,
            None => Ok(()),
        }
    }

    /// Returns the current filter generation, or `None` without a filter.
    pub fn bloom_generation(&self) -> Option<u64> {
        self.lock().bloom.as_ref().map(|b| b.generation)
    }

    /// Returns the number of cached entries.
    pub fn size(&self) -> usize {
        self.lock().store.size()
    }

    /// Returns a copy of the statistics.
    pub fn stats(&self) -> NearCacheStats {
        self.lock().store.stats()
    }

    fn maybe_rebuild(&self, state: &mut State) {
        let threshold =
            ((self.config.max_size() as f64) * self.config.bloom_rebuild_ratio()).ceil() as u64;
        let State {
            store,
            reservations,
            bloom,
            ..
        } = state;
        let Some(bloom) = bloom.as_mut() else {
            return;
        };
        if bloom.removed_since_rebuild < threshold.max(1) {
            return;
        }

        let keys = store.keys().chain(reservations.keys()).map(|k| &k[..]);
        bloom.filter = BloomFilter::from_keys(self.config.bloom_bits(), keys);
        bloom.generation += 1;
        bloom.removed_since_rebuild = 0;
        tracing::debug!(
            generation = bloom.generation,
            entries = store.size(),
            "rebuilt near-cache bloom filter"
        );
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
