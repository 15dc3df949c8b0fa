//! Byte-level operations on one remote cache.

use std::sync::Arc;

use bytes::Bytes;
use hotrod_core::protocol::{Expiration, MetadataValue, VersionedValue};
use hotrod_core::Result;

use crate::cache::{InvalidatedNearCache, NearCacheStats};
use crate::dispatcher::Dispatcher;
use crate::iteration::{EntryIterator, IterationOptions};
use crate::listener::{ListenerFilter, ListenerHandle, ListenerId, ListenerRegistry};
use crate::operation::{OperationFactory, ServerStatistics, VersionedOutcome, WriteOutcome};

/// A near-cache and the listener that keeps it coherent.
#[derive(Debug)]
pub(crate) struct NearCacheBinding {
    cache: Arc<InvalidatedNearCache>,
    listener: ListenerHandle,
}

impl NearCacheBinding {
    pub(crate) fn new(cache: Arc<InvalidatedNearCache>, listener: ListenerHandle) -> Self {
        Self { cache, listener }
    }

    fn listener_id(&self) -> ListenerId {
        self.listener.id()
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    dispatcher: Arc<Dispatcher>,
    listeners: Arc<ListenerRegistry>,
    near_cache: Option<NearCacheBinding>,
    segment_aware: bool,
}

/// A handle on one cache of the cluster.
///
/// Keys and values are opaque bytes; marshalling application types happens
/// above this layer. Handles are cheap to clone and share the near-cache, if
/// one is configured for the cache.
#[derive(Debug, Clone)]
pub struct RemoteCache {
    shared: Arc<Shared>,
    operations: OperationFactory,
}

impl RemoteCache {
    pub(crate) fn new(
        name: String,
        dispatcher: Arc<Dispatcher>,
        listeners: Arc<ListenerRegistry>,
        near_cache: Option<NearCacheBinding>,
        force_return_values: bool,
    ) -> Self {
        let segment_aware = dispatcher
            .pool()
            .factory()
            .wire()
            .supports_iteration_segments();
        Self {
            operations: OperationFactory::new(name.clone(), force_return_values),
            shared: Arc::new(Shared {
                name,
                dispatcher,
                listeners,
                near_cache,
                segment_aware,
            }),
        }
    }

    /// Returns the name of this cache.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns a handle that does or does not ask writes for previous values.
    pub fn with_force_return_values(&self, enabled: bool) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            operations: self.operations.with_force_return_values(enabled),
        }
    }

    /// Returns whether writes ask for previous values.
    pub fn force_return_values(&self) -> bool {
        self.operations.force_return_values()
    }

    /// Retrieves the value associated with the given key.
    ///
    /// With a near-cache configured, hits are served locally and misses
    /// populate it.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let key = key.into();
        match &self.shared.near_cache {
            Some(near) => Ok(self.get_through(near, key).await?.map(|v| v.value)),
            None => self.dispatcher().execute(&self.operations.get(key)).await,
        }
    }

    async fn get_through(
        &self,
        near: &NearCacheBinding,
        key: Bytes,
    ) -> Result<Option<VersionedValue>> {
        let telemetry = self.dispatcher().telemetry();
        if let Some(value) = near.cache.get(&key) {
            telemetry.near_cache_hit(self.name());
            return Ok(Some(value));
        }
        telemetry.near_cache_miss(self.name());

        let reservation = near.cache.reserve(key.clone());
        if near.cache.needs_shipping(&reservation) {
            let listeners = &self.shared.listeners;
            let id = near.listener_id();
            let shipped = near
                .cache
                .ship_for(&reservation, |bits| listeners.update_bloom_filter(id, bits))
                .await;
            if let Err(e) = shipped {
                // The server may not know this key is cached, so do not cache it.
                tracing::debug!(cache = self.name(), error = %e, "bloom filter not shipped, bypassing near-cache");
                near.cache.cancel(reservation);
                return self
                    .dispatcher()
                    .execute(&self.operations.get_versioned(key))
                    .await;
            }
        }

        match self
            .dispatcher()
            .execute(&self.operations.get_versioned(key))
            .await
        {
            Ok(value) => {
                near.cache.complete(reservation, value.clone());
                Ok(value)
            }
            Err(e) => {
                near.cache.cancel(reservation);
                Err(e)
            }
        }
    }

    /// Retrieves a value together with its data version.
    ///
    /// The version is what [`replace_with_version`](Self::replace_with_version)
    /// and [`remove_with_version`](Self::remove_with_version) expect.
    pub async fn get_versioned(&self, key: impl Into<Bytes>) -> Result<Option<VersionedValue>> {
        self.dispatcher()
            .execute(&self.operations.get_versioned(key.into()))
            .await
    }

    /// Retrieves a value with its version and expiration metadata.
    pub async fn get_with_metadata(&self, key: impl Into<Bytes>) -> Result<Option<MetadataValue>> {
        self.dispatcher()
            .execute(&self.operations.get_with_metadata(key.into()))
            .await
    }

    /// Returns `true` if the cache holds the key.
    pub async fn contains_key(&self, key: impl Into<Bytes>) -> Result<bool> {
        let key = key.into();
        if let Some(near) = &self.shared.near_cache {
            if near.cache.get(&key).is_some() {
                return Ok(true);
            }
        }
        self.dispatcher()
            .execute(&self.operations.contains_key(key))
            .await
    }

    /// Stores a value with the server's default expiration.
    ///
    /// Returns the previous value when previous values are requested.
    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.put_with_expiration(key, value, Expiration::default())
            .await
    }

    /// Stores a value with explicit lifespan and max-idle.
    pub async fn put_with_expiration(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> Result<Option<Bytes>> {
        let key = key.into();
        let result = self
            .dispatcher()
            .execute(&self.operations.put(key.clone(), value.into(), expiration))
            .await;
        self.invalidate_local(&key);
        result
    }

    /// Stores a value only if the key is absent.
    pub async fn put_if_absent(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> Result<WriteOutcome> {
        let key = key.into();
        let result = self
            .dispatcher()
            .execute(&self.operations.put_if_absent(key.clone(), value.into(), expiration))
            .await;
        self.invalidate_local(&key);
        result
    }

    /// Replaces a value only if the key is present.
    pub async fn replace(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> Result<WriteOutcome> {
        let key = key.into();
        let result = self
            .dispatcher()
            .execute(&self.operations.replace(key.clone(), value.into(), expiration))
            .await;
        self.invalidate_local(&key);
        result
    }

    /// Replaces a value only if its data version is still `version`.
    pub async fn replace_with_version(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        version: i64,
        expiration: Expiration,
    ) -> Result<VersionedOutcome> {
        let key = key.into();
        let result = self
            .dispatcher()
            .execute(&self.operations.replace_if_unmodified(
                key.clone(),
                value.into(),
                version,
                expiration,
            ))
            .await;
        self.invalidate_local(&key);
        result
    }

    /// Removes a key.
    pub async fn remove(&self, key: impl Into<Bytes>) -> Result<WriteOutcome> {
        let key = key.into();
        let result = self
            .dispatcher()
            .execute(&self.operations.remove(key.clone()))
            .await;
        self.invalidate_local(&key);
        result
    }

    /// Removes a key only if its data version is still `version`.
    pub async fn remove_with_version(
        &self,
        key: impl Into<Bytes>,
        version: i64,
    ) -> Result<VersionedOutcome> {
        let key = key.into();
        let result = self
            .dispatcher()
            .execute(&self.operations.remove_if_unmodified(key.clone(), version))
            .await;
        self.invalidate_local(&key);
        result
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<()> {
        let result = self.dispatcher().execute(&self.operations.clear()).await;
        if let Some(near) = &self.shared.near_cache {
            near.cache.clear();
        }
        result
    }

    /// Returns the number of entries in the cluster.
    pub async fn size(&self) -> Result<u64> {
        self.dispatcher().execute(&self.operations.size()).await
    }

    /// Returns `true` if the cache holds no entries.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    /// Returns the statistics of one server.
    pub async fn stats(&self) -> Result<ServerStatistics> {
        self.dispatcher().execute(&self.operations.stats()).await
    }

    /// Checks that a server answers for this cache.
    pub async fn ping(&self) -> Result<()> {
        self.dispatcher().execute(&self.operations.ping()).await
    }

    /// Iterates every entry of the cache.
    pub fn iter(&self, options: IterationOptions) -> EntryIterator {
        EntryIterator::new(
            Arc::clone(&self.shared.dispatcher),
            self.operations.clone(),
            options,
            self.shared.segment_aware,
        )
    }

    /// Registers a listener for changes to this cache.
    pub async fn add_listener(&self, filter: Option<ListenerFilter>) -> Result<ListenerHandle> {
        self.shared
            .listeners
            .register(self.name(), filter, self.operations.force_return_values())
            .await
    }

    /// Deregisters a listener. Returns `false` if it was already gone.
    pub async fn remove_listener(&self, handle: ListenerHandle) -> Result<bool> {
        self.shared.listeners.unregister(handle).await
    }

    /// Returns `true` if a near-cache is configured for this cache.
    pub fn has_near_cache(&self) -> bool {
        self.shared.near_cache.is_some()
    }

    /// Returns the near-cache statistics, if a near-cache is configured.
    pub fn near_cache_stats(&self) -> Option<NearCacheStats> {
        self.shared.near_cache.as_ref().map(|n| n.cache.stats())
    }

    /// Returns the number of entries held locally.
    pub fn near_cache_size(&self) -> usize {
        self.shared
            .near_cache
            .as_ref()
            .map(|n| n.cache.size())
            .unwrap_or(0)
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    fn invalidate_local(&self, key: &Bytes) {
        if let Some(near) = &self.shared.near_cache {
            near.cache.invalidate(key);
        }
    }
}
