//! Keeps listener registrations alive across server failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use hotrod_core::protocol::ClientEvent;
use hotrod_core::{HotRodError, Result, ServerAddress};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::instrument;

use super::{ListenerControl, ListenerFilter, ListenerHandle, ListenerId, ListenerStats};
use crate::cache::InvalidatedNearCache;
use crate::config::RetryConfig;
use crate::connection::{Transport, TransportFactory};
use crate::dispatcher::{calculate_backoff_with_jitter, Dispatcher};
use crate::operation::{Operation, OperationFactory};

#[derive(Debug)]
enum Target {
    /// Events go to the application through a handle.
    Client {
        filter: ListenerFilter,
        sink: mpsc::UnboundedSender<ClientEvent>,
    },
    /// Events invalidate a near-cache.
    NearCache(Arc<InvalidatedNearCache>),
}

/// One listener and the dedicated connection it is registered on.
#[derive(Debug)]
struct Registration {
    id: ListenerId,
    operations: OperationFactory,
    target: Target,
    channel: tokio::sync::Mutex<Option<Transport>>,
    address: Mutex<Option<ServerAddress>>,
    control: Arc<ListenerControl>,
}

impl Registration {
    fn cache_name(&self) -> &str {
        self.operations.cache_name()
    }

    fn add_operation(&self) -> Operation<()> {
        let id = self.id.to_bytes();
        match &self.target {
            Target::Client { filter, .. } => self.operations.add_client_listener(
                id,
                filter.include_current_state,
                filter.filter_factory.clone(),
                filter.converter_factory.clone(),
                filter.use_raw_data,
            ),
            Target::NearCache(cache) if cache.uses_bloom_filter() => self
                .operations
                .add_bloom_near_cache_listener(id, cache.config().bloom_bits()),
            Target::NearCache(_) => self.operations.add_client_listener(id, false, None, None, false),
        }
    }

    fn address(&self) -> Option<ServerAddress> {
        self.address.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_address(&self, address: Option<ServerAddress>) {
        *self.address.lock().unwrap_or_else(|p| p.into_inner()) = address;
    }

    fn deliver(&self, event: ClientEvent, stats: &ListenerStats) {
        if !self.id.matches(&event.listener_id) {
            tracing::debug!(listener = %self.id, "dropping event addressed to another listener");
            stats.record_error();
            return;
        }
        stats.record_event();
        match &self.target {
            Target::Client { sink, .. } => {
                if sink.send(event).is_err() {
                    stats.record_error();
                }
            }
            Target::NearCache(cache) => match event.key() {
                Some(key) => cache.invalidate(key),
                // A converted payload does not say which key changed.
                None => cache.clear(),
            },
        }
    }

    fn connection_lost(&self) {
        if let Target::NearCache(cache) = &self.target {
            cache.mark_stale();
        }
    }
}

struct Shared {
    dispatcher: Arc<Dispatcher>,
    factory: TransportFactory,
    retry: RetryConfig,
    listeners: Mutex<HashMap<ListenerId, (Arc<Registration>, Option<JoinHandle<()>>)>>,
    stats: ListenerStats,
}

impl Shared {
    fn listeners(
        &self,
    ) -> MutexGuard<'_, HashMap<ListenerId, (Arc<Registration>, Option<JoinHandle<()>>)>> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers on the first candidate server that accepts, preferring any
    /// server other than `avoid`.
    async fn establish(
        &self,
        registration: &Registration,
        avoid: Option<&ServerAddress>,
    ) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut candidates = self
            .dispatcher
            .router()
            .candidates(registration.cache_name(), None);
        candidates.sort_by_key(|c| Some(c) == avoid);

        let operation = registration.add_operation();
        let mut last_error = None;
        for address in candidates {
            let transport = match self
                .factory
                .connect_with_events(&address, events_tx.clone())
                .await
            {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::debug!(listener = %registration.id, address = %address, error = %e, "listener connect failed");
                    last_error = Some(e);
                    continue;
                }
            };

            match self
                .dispatcher
                .execute_on_transport(&transport, &operation)
                .await
            {
                Ok(()) => {
                    *registration.channel.lock().await = Some(transport);
                    registration.set_address(Some(address.clone()));
                    tracing::info!(
                        listener = %registration.id,
                        cache = registration.cache_name(),
                        address = %address,
                        "listener registered"
                    );
                    if let Target::NearCache(cache) = &registration.target {
                        self.resync_near_cache(registration, cache).await;
                    }
                    return Ok(events_rx);
                }
                Err(e) => {
                    tracing::warn!(listener = %registration.id, address = %address, error = %e, "listener registration rejected");
                    transport.close();
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            HotRodError::Connection(format!(
                "no server available to register {}",
                registration.id
            ))
        }))
    }

    /// Pushes the current bloom filter to the new server, then lets the
    /// near-cache serve reads again.
    async fn resync_near_cache(&self, registration: &Registration, cache: &InvalidatedNearCache) {
        if let Some(generation) = cache.bloom_generation() {
            let shipped = cache
                .ship_bloom(generation, |bits| self.send_bloom_filter(registration, bits))
                .await;
            if let Err(e) = shipped {
                tracing::warn!(listener = %registration.id, error = %e, "failed to ship bloom filter");
            }
        }
        cache.mark_fresh();
    }

    async fn send_bloom_filter(&self, registration: &Registration, bits: Bytes) -> Result<()> {
        let channel = registration.channel.lock().await;
        let transport = channel.as_ref().ok_or_else(|| {
            HotRodError::Connection(format!("{} is not connected", registration.id))
        })?;
        let operation = registration
            .operations
            .update_bloom_filter(registration.id.to_bytes(), bits);
        self.dispatcher
            .execute_on_transport(transport, &operation)
            .await
    }

    /// Moves a listener whose connection dropped to another server.
    ///
    /// Returns `None` if the listener was deregistered meanwhile.
    async fn reestablish(
        &self,
        registration: &Registration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        if let Some(transport) = registration.channel.lock().await.take() {
            transport.close();
        }
        let lost = registration.address();
        registration.set_address(None);
        registration.connection_lost();
        tracing::warn!(
            listener = %registration.id,
            address = ?lost,
            "listener connection lost, re-registering"
        );

        let mut backoff = self.retry.initial_backoff();
        let mut attempt = 0u32;
        loop {
            if !registration.control.is_active() {
                return None;
            }
            attempt += 1;
            match self.establish(registration, lost.as_ref()).await {
                Ok(events) => {
                    self.stats.record_reregistration();
                    tracing::info!(listener = %registration.id, attempt, "listener re-registered");
                    return Some(events);
                }
                Err(e) => {
                    tracing::warn!(listener = %registration.id, attempt, error = %e, "listener re-registration failed");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = calculate_backoff_with_jitter(
                backoff,
                self.retry.multiplier(),
                self.retry.max_backoff(),
                self.retry.jitter(),
            );
        }
    }

    /// Removes the listener from its server and closes its connection.
    async fn teardown(&self, registration: &Registration) {
        let Some(transport) = registration.channel.lock().await.take() else {
            return;
        };
        let operation = registration
            .operations
            .remove_client_listener(registration.id.to_bytes());
        match self
            .dispatcher
            .execute_on_transport(&transport, &operation)
            .await
        {
            Ok(known) => {
                tracing::debug!(listener = %registration.id, known, "listener removed")
            }
            Err(e) => {
                tracing::debug!(listener = %registration.id, error = %e, "failed to remove listener")
            }
        }
        transport.close();
        registration.set_address(None);
    }
}

async fn run_listener(
    shared: Arc<Shared>,
    registration: Arc<Registration>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) {
    let mut shutdown = registration.control.shutdown_receiver();
    loop {
        if !registration.control.is_active() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => registration.deliver(event, &shared.stats),
                None => match shared.reestablish(&registration, &mut shutdown).await {
                    Some(next) => events = next,
                    None => break,
                },
            },
        }
    }

    shared.teardown(&registration).await;
    shared.listeners().remove(&registration.id);
    tracing::debug!(listener = %registration.id, "listener task finished");
}

/// Registers listeners on dedicated connections and keeps them registered.
///
/// Each listener gets its own transport so pushed events never compete with
/// request traffic. When that transport fails the listener is registered
/// again on another server picked by the router; a near-cache fed by the
/// listener is bypassed until the new registration completes.
pub struct ListenerRegistry {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.count())
            .finish_non_exhaustive()
    }
}

impl ListenerRegistry {
    /// Creates a registry that opens connections like the dispatcher's pool.
    pub fn new(dispatcher: Arc<Dispatcher>, retry: RetryConfig) -> Self {
        let factory = dispatcher.pool().factory().clone();
        Self {
            shared: Arc::new(Shared {
                dispatcher,
                factory,
                retry,
                listeners: Mutex::new(HashMap::new()),
                stats: ListenerStats::new(),
            }),
        }
    }

    /// Registers a listener on `cache_name` and returns the handle its events
    /// arrive on.
    #[instrument(name = "listener_registry.register", skip(self, filter), fields(cache = cache_name))]
    pub async fn register(
        &self,
        cache_name: &str,
        filter: Option<ListenerFilter>,
        force_return_values: bool,
    ) -> Result<ListenerHandle> {
        let (sink, events) = mpsc::unbounded_channel();
        let target = Target::Client {
            filter: filter.unwrap_or_default(),
            sink,
        };
        let (id, control) = self
            .start(cache_name, force_return_values, target)
            .await?;
        Ok(ListenerHandle::new(id, cache_name.to_string(), events, control))
    }

    /// Registers the listener that keeps `cache` coherent with `cache_name`.
    ///
    /// The returned handle yields no events; dropping it stops invalidation.
    #[instrument(name = "listener_registry.register_near_cache", skip(self, cache), fields(cache = cache_name))]
    pub async fn register_near_cache(
        &self,
        cache_name: &str,
        cache: Arc<InvalidatedNearCache>,
    ) -> Result<ListenerHandle> {
        let (id, control) = self
            .start(cache_name, false, Target::NearCache(cache))
            .await?;
        let (_, events) = mpsc::unbounded_channel();
        Ok(ListenerHandle::new(id, cache_name.to_string(), events, control))
    }

    async fn start(
        &self,
        cache_name: &str,
        force_return_values: bool,
        target: Target,
    ) -> Result<(ListenerId, Arc<ListenerControl>)> {
        let control = Arc::new(ListenerControl::new());
        let registration = Arc::new(Registration {
            id: ListenerId::new(),
            operations: OperationFactory::new(cache_name, force_return_values),
            target,
            channel: tokio::sync::Mutex::new(None),
            address: Mutex::new(None),
            control: Arc::clone(&control),
        });

        let events = self.shared.establish(&registration, None).await?;
        let id = registration.id;
        let task = tokio::spawn(run_listener(
            Arc::clone(&self.shared),
            Arc::clone(&registration),
            events,
        ));
        self.shared
            .listeners()
            .insert(id, (registration, Some(task)));
        Ok((id, control))
    }

    /// Deregisters a listener and waits until its server was told.
    ///
    /// Returns `false` if the listener was already gone.
    #[instrument(name = "listener_registry.unregister", skip(self, handle), fields(listener = %handle.id()))]
    pub async fn unregister(&self, handle: ListenerHandle) -> Result<bool> {
        let id = handle.id();
        let entry = self.shared.listeners().remove(&id);
        drop(handle);
        let Some((_, task)) = entry else {
            return Ok(false);
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(listener = %id, error = %e, "listener task failed");
            }
        }
        Ok(true)
    }

    /// Replaces the bloom filter of a near-cache listener on its server.
    pub async fn update_bloom_filter(&self, id: ListenerId, bits: Bytes) -> Result<()> {
        let registration = self
            .registration(id)
            .ok_or_else(|| HotRodError::Closed(format!("{} is not registered", id)))?;
        self.shared.send_bloom_filter(&registration, bits).await
    }

    /// Returns the server a listener is currently registered on.
    pub fn listener_address(&self, id: ListenerId) -> Option<ServerAddress> {
        self.registration(id)?.address()
    }

    /// Returns the number of registered listeners.
    pub fn count(&self) -> usize {
        self.shared.listeners().len()
    }

    /// Returns the listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.shared.stats
    }

    /// Deregisters every listener.
    pub async fn close_all(&self) {
        let entries: Vec<_> = self.shared.listeners().drain().collect();
        for (id, (registration, task)) in entries {
            registration.control.deactivate();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    tracing::warn!(listener = %id, error = %e, "listener task failed");
                }
            }
        }
    }

    fn registration(&self, id: ListenerId) -> Option<Arc<Registration>> {
        self.shared
            .listeners()
            .get(&id)
            .map(|(registration, _)| Arc::clone(registration))
    }
}
