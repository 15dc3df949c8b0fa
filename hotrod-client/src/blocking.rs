//! Synchronous facade over the async client.
//!
//! [`BlockingRemoteCacheManager`] owns a small multi-threaded Tokio runtime
//! that drives connections and listeners in the background; every call
//! blocks the calling thread until the matching async operation finishes.
//! Do not use it from inside another async runtime.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hotrod_core::protocol::{ClientEvent, Expiration, IterationEntry, MetadataValue, VersionedValue};
use hotrod_core::Result;
use tokio::runtime::Runtime;

use crate::client::RemoteCacheManager;
use crate::config::ClientConfig;
use crate::iteration::{EntryIterator, IterationOptions};
use crate::listener::{ListenerFilter, ListenerHandle, ListenerId};
use crate::operation::{ServerStatistics, VersionedOutcome, WriteOutcome};
use crate::remote_cache::RemoteCache;

const WORKER_THREADS: usize = 2;

/// Blocking counterpart of [`RemoteCacheManager`].
#[derive(Debug)]
pub struct BlockingRemoteCacheManager {
    manager: RemoteCacheManager,
    runtime: Arc<Runtime>,
}

impl BlockingRemoteCacheManager {
    /// Starts a runtime and connects to the cluster.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("hotrod-client")
            .enable_all()
            .build()?;
        let manager = runtime.block_on(RemoteCacheManager::new(config))?;
        Ok(Self {
            manager,
            runtime: Arc::new(runtime),
        })
    }

    /// Returns a handle on the named cache.
    pub fn get_cache(&self, name: &str) -> Result<BlockingRemoteCache> {
        let cache = self.runtime.block_on(self.manager.get_cache(name))?;
        Ok(BlockingRemoteCache {
            cache,
            runtime: Arc::clone(&self.runtime),
        })
    }

    /// Returns the async client this facade drives.
    pub fn manager(&self) -> &RemoteCacheManager {
        &self.manager
    }

    /// Deregisters every listener and closes every connection.
    pub fn close(&self) {
        self.runtime.block_on(self.manager.close());
    }
}

/// Blocking counterpart of [`RemoteCache`].
#[derive(Debug, Clone)]
pub struct BlockingRemoteCache {
    cache: RemoteCache,
    runtime: Arc<Runtime>,
}

impl BlockingRemoteCache {
    /// Returns the name of this cache.
    pub fn name(&self) -> &str {
        self.cache.name()
    }

    /// Returns the async handle this facade drives.
    pub fn as_async(&self) -> &RemoteCache {
        &self.cache
    }

    /// See [`RemoteCache::get`].
    pub fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.runtime.block_on(self.cache.get(key))
    }

    /// See [`RemoteCache::get_versioned`].
    pub fn get_versioned(&self, key: impl Into<Bytes>) -> Result<Option<VersionedValue>> {
        self.runtime.block_on(self.cache.get_versioned(key))
    }

    /// See [`RemoteCache::get_with_metadata`].
    pub fn get_with_metadata(&self, key: impl Into<Bytes>) -> Result<Option<MetadataValue>> {
        self.runtime.block_on(self.cache.get_with_metadata(key))
    }

    /// See [`RemoteCache::contains_key`].
    pub fn contains_key(&self, key: impl Into<Bytes>) -> Result<bool> {
        self.runtime.block_on(self.cache.contains_key(key))
    }

    /// See [`RemoteCache::put`].
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.runtime.block_on(self.cache.put(key, value))
    }

    /// See [`RemoteCache::put_with_expiration`].
    pub fn put_with_expiration(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> Result<Option<Bytes>> {
        self.runtime
            .block_on(self.cache.put_with_expiration(key, value, expiration))
    }

    /// See [`RemoteCache::put_if_absent`].
    pub fn put_if_absent(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> Result<WriteOutcome> {
        self.runtime
            .block_on(self.cache.put_if_absent(key, value, expiration))
    }

    /// See [`RemoteCache::replace`].
    pub fn replace(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiration: Expiration,
    ) -> Result<WriteOutcome> {
        self.runtime.block_on(self.cache.replace(key, value, expiration))
    }

    /// See [`RemoteCache::replace_with_version`].
    pub fn replace_with_version(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        version: i64,
        expiration: Expiration,
    ) -> Result<VersionedOutcome> {
        self.runtime
            .block_on(self.cache.replace_with_version(key, value, version, expiration))
    }

    /// See [`RemoteCache::remove`].
    pub fn remove(&self, key: impl Into<Bytes>) -> Result<WriteOutcome> {
        self.runtime.block_on(self.cache.remove(key))
    }

    /// See [`RemoteCache::remove_with_version`].
    pub fn remove_with_version(&self, key: impl Into<Bytes>, version: i64) -> Result<VersionedOutcome> {
        self.runtime
            .block_on(self.cache.remove_with_version(key, version))
    }

    /// See [`RemoteCache::clear`].
    pub fn clear(&self) -> Result<()> {
        self.runtime.block_on(self.cache.clear())
    }

    /// See [`RemoteCache::size`].
    pub fn size(&self) -> Result<u64> {
        self.runtime.block_on(self.cache.size())
    }

    /// See [`RemoteCache::stats`].
    pub fn stats(&self) -> Result<ServerStatistics> {
        self.runtime.block_on(self.cache.stats())
    }

    /// See [`RemoteCache::ping`].
    pub fn ping(&self) -> Result<()> {
        self.runtime.block_on(self.cache.ping())
    }

    /// Iterates every entry of the cache.
    pub fn iter(&self, options: IterationOptions) -> BlockingEntryIterator {
        BlockingEntryIterator {
            inner: self.cache.iter(options),
            runtime: Arc::clone(&self.runtime),
            failed: false,
        }
    }

    /// See [`RemoteCache::add_listener`].
    pub fn add_listener(&self, filter: Option<ListenerFilter>) -> Result<BlockingListener> {
        let handle = self.runtime.block_on(self.cache.add_listener(filter))?;
        Ok(BlockingListener {
            handle: Some(handle),
            runtime: Arc::clone(&self.runtime),
        })
    }

    /// See [`RemoteCache::remove_listener`].
    pub fn remove_listener(&self, mut listener: BlockingListener) -> Result<bool> {
        match listener.handle.take() {
            Some(handle) => self.runtime.block_on(self.cache.remove_listener(handle)),
            None => Ok(false),
        }
    }
}

/// Blocking iterator over the entries of a cache.
///
/// Yields at most one error, after which it ends.
#[derive(Debug)]
pub struct BlockingEntryIterator {
    inner: EntryIterator,
    runtime: Arc<Runtime>,
    failed: bool,
}

impl Iterator for BlockingEntryIterator {
    type Item = Result<IterationEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.runtime.block_on(self.inner.next()) {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for BlockingEntryIterator {
    fn drop(&mut self) {
        self.runtime.block_on(self.inner.close());
    }
}

/// Blocking view of a registered listener.
#[derive(Debug)]
pub struct BlockingListener {
    handle: Option<ListenerHandle>,
    runtime: Arc<Runtime>,
}

impl BlockingListener {
    /// Returns the listener ID.
    pub fn id(&self) -> Option<ListenerId> {
        self.handle.as_ref().map(ListenerHandle::id)
    }

    /// Waits for the next event. Returns `None` once the listener is gone.
    pub fn next_event(&mut self) -> Option<ClientEvent> {
        let handle = self.handle.as_mut()?;
        self.runtime.block_on(handle.next_event())
    }

    /// Waits at most `timeout` for the next event.
    pub fn next_event_timeout(&mut self, timeout: Duration) -> Option<ClientEvent> {
        let handle = self.handle.as_mut()?;
        self.runtime
            .block_on(async { tokio::time::timeout(timeout, handle.next_event()).await.ok().flatten() })
    }
}
