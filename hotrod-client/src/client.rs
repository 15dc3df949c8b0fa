//! Hot Rod client entry point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hotrod_core::protocol::WireCodec;
use hotrod_core::{HotRodError, Result, ServerAddress, Topology};

use crate::cache::{InvalidatedNearCache, NearCacheMode};
use crate::config::ClientConfig;
use crate::connection::{ServerDiscovery, StaticServerDiscovery, TransportFactory, TransportPool};
use crate::dispatcher::Dispatcher;
use crate::listener::{ListenerRegistry, ListenerStats};
use crate::operation::OperationFactory;
use crate::remote_cache::{NearCacheBinding, RemoteCache};
use crate::routing::ConsistentHashRouter;
use crate::telemetry::{NoopTelemetry, Telemetry};

/// The main entry point for talking to a Hot Rod cluster.
///
/// Owns the router, the connection pool and the listener registry shared by
/// every [`RemoteCache`] it hands out.
///
/// # Example
///
/// ```ignore
/// use hotrod_client::{ClientConfig, RemoteCacheManager};
/// use hotrod_core::ServerAddress;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::builder()
///         .add_server(ServerAddress::new("127.0.0.1", 11222))
///         .build()?;
///
///     let manager = RemoteCacheManager::new(config).await?;
///     let cache = manager.get_cache("books").await?;
///
///     cache.put("isbn-1", "Dune").await?;
///     let value = cache.get("isbn-1").await?;
///
///     manager.close().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct RemoteCacheManager {
    config: Arc<ClientConfig>,
    dispatcher: Arc<Dispatcher>,
    listeners: Arc<ListenerRegistry>,
    caches: tokio::sync::Mutex<HashMap<String, RemoteCache>>,
    closed: AtomicBool,
}

impl RemoteCacheManager {
    /// Creates a client with default telemetry and connects to the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if no bootstrap server is configured or none of them
    /// answers a ping.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Returns a builder for a client with custom telemetry or discovery.
    pub fn builder(config: ClientConfig) -> RemoteCacheManagerBuilder {
        RemoteCacheManagerBuilder::new(config)
    }

    /// Returns a handle on the named cache.
    ///
    /// Caches with a near-cache configured register their invalidation
    /// listener here; later calls for the same name share it.
    pub async fn get_cache(&self, name: &str) -> Result<RemoteCache> {
        self.ensure_open()?;
        let mut caches = self.caches.lock().await;
        if let Some(cache) = caches.get(name) {
            return Ok(cache.clone());
        }

        let near_cache = match self.config.find_near_cache(name) {
            Some(near_config) => {
                let wire = self.dispatcher.pool().factory().wire();
                let bloom = match near_config.mode() {
                    NearCacheMode::BloomFiltered if wire.supports_bloom_filter() => true,
                    NearCacheMode::BloomFiltered => {
                        tracing::warn!(
                            cache = name,
                            version = %wire.version(),
                            "protocol version lacks bloom filter listeners, using plain invalidation"
                        );
                        false
                    }
                    NearCacheMode::Invalidated => false,
                };
                let store = Arc::new(InvalidatedNearCache::new(near_config.clone(), bloom));
                let listener = self
                    .listeners
                    .register_near_cache(name, Arc::clone(&store))
                    .await?;
                Some(NearCacheBinding::new(store, listener))
            }
            None => None,
        };

        let cache = RemoteCache::new(
            name.to_string(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.listeners),
            near_cache,
            self.config.force_return_values(),
        );
        caches.insert(name.to_string(), cache.clone());
        tracing::debug!(cache = name, near_cache = cache.has_near_cache(), "created cache handle");
        Ok(cache)
    }

    /// Returns a handle on the server's default cache.
    pub async fn get_default_cache(&self) -> Result<RemoteCache> {
        self.get_cache("").await
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the topology currently used to route requests for a cache.
    pub fn topology(&self, cache_name: &str) -> Option<Arc<Topology>> {
        self.dispatcher.router().current_topology(cache_name)
    }

    /// Returns every server the client currently knows of.
    pub fn servers(&self) -> Vec<ServerAddress> {
        self.dispatcher.router().all_servers()
    }

    /// Returns the number of open connections, idle and in use.
    pub fn connection_count(&self) -> usize {
        let pool = self.dispatcher.pool();
        pool.addresses()
            .iter()
            .map(|address| pool.idle_count(address) + pool.active_count(address))
            .sum()
    }

    /// Returns statistics of every listener this client registered.
    pub fn listener_stats(&self) -> &ListenerStats {
        self.listeners.stats()
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deregisters every listener and closes every connection.
    ///
    /// Operations still in flight fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(servers = self.servers().len(), "shutting down Hot Rod client");
        self.caches.lock().await.clear();
        self.listeners.close_all().await;
        self.dispatcher.pool().close_all();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HotRodError::Closed("client is closed".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`RemoteCacheManager`].
#[derive(Debug)]
pub struct RemoteCacheManagerBuilder {
    config: ClientConfig,
    telemetry: Option<Arc<dyn Telemetry>>,
    discovery: Option<Arc<dyn ServerDiscovery>>,
}

impl RemoteCacheManagerBuilder {
    /// Creates a builder for `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            telemetry: None,
            discovery: None,
        }
    }

    /// Sets the telemetry sink shared by every component.
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Sets where bootstrap servers come from, replacing the configured list.
    pub fn discovery(mut self, discovery: Arc<dyn ServerDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Builds the client without contacting any server.
    pub async fn build_lazy(self) -> Result<RemoteCacheManager> {
        let config = self.config;
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(NoopTelemetry));
        let discovery = self
            .discovery
            .unwrap_or_else(|| Arc::new(StaticServerDiscovery::new(config.servers().to_vec())));

        let servers = discovery.discover().await?;
        if servers.is_empty() {
            return Err(HotRodError::Configuration(
                "no bootstrap servers configured".to_string(),
            ));
        }

        let wire = WireCodec::new(config.protocol_version(), config.intelligence()).with_media_types(
            config.key_media_type().clone(),
            config.value_media_type().clone(),
        );
        let factory = TransportFactory::new(
            Arc::new(wire),
            config.connect_timeout(),
            config.tcp_no_delay(),
            Arc::clone(&telemetry),
        );
        let pool = Arc::new(TransportPool::new(factory, config.pool().clone()));
        let router = Arc::new(ConsistentHashRouter::new(config.hasher(), servers));
        let dispatcher = Arc::new(Dispatcher::new(
            router,
            pool,
            config.retry().clone(),
            config.socket_timeout(),
            telemetry,
        ));
        let listeners = Arc::new(ListenerRegistry::new(
            Arc::clone(&dispatcher),
            config.retry().clone(),
        ));

        Ok(RemoteCacheManager {
            config: Arc::new(config),
            dispatcher,
            listeners,
            caches: tokio::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Builds the client and pings the cluster, learning its topology.
    pub async fn build(self) -> Result<RemoteCacheManager> {
        let manager = self.build_lazy().await?;
        manager
            .dispatcher
            .execute(&OperationFactory::new("", false).ping())
            .await?;
        tracing::info!(
            servers = manager.servers().len(),
            version = %manager.config.protocol_version(),
            "connected to Hot Rod cluster"
        );
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RemoteCacheManager>();
    }

    #[tokio::test]
    async fn test_build_lazy_does_not_connect() {
        let config = ClientConfig::builder()
            .add_server(ServerAddress::new("127.0.0.1", 1))
            .build()
            .unwrap();
        let manager = RemoteCacheManager::builder(config).build_lazy().await.unwrap();
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.servers(), vec![ServerAddress::new("127.0.0.1", 1)]);
    }

    #[tokio::test]
    async fn test_empty_discovery_is_rejected() {
        let config = ClientConfig::builder().build().unwrap();
        let result = RemoteCacheManager::builder(config)
            .discovery(Arc::new(StaticServerDiscovery::new(Vec::new())))
            .build_lazy()
            .await;
        assert!(matches!(result, Err(HotRodError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_closed_client_refuses_caches() {
        let config = ClientConfig::builder().build().unwrap();
        let manager = RemoteCacheManager::builder(config).build_lazy().await.unwrap();
        manager.close().await;
        assert!(manager.is_closed());
        assert!(matches!(
            manager.get_cache("c").await,
            Err(HotRodError::Closed(_))
        ));
    }
}
