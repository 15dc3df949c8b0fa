//! Per-server pools of reusable transports.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hotrod_core::{HotRodError, Result, ServerAddress};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::instrument;

use super::transport::{Transport, TransportFactory};
use crate::config::PoolConfig;

/// Deadline for the health-check ping of a long-idle transport.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

struct IdleTransport {
    transport: Transport,
    idle_since: Instant,
}

/// Connections to one server.
struct ServerPool {
    address: ServerAddress,
    idle: Mutex<VecDeque<IdleTransport>>,
    permits: Arc<Semaphore>,
    waiting: AtomicU32,
}

impl ServerPool {
    fn new(address: ServerAddress, max_active: u32) -> Self {
        Self {
            address,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max_active as usize)),
            waiting: AtomicU32::new(0),
        }
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleTransport>> {
        self.idle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn close_idle(&self) -> usize {
        let drained: Vec<IdleTransport> = self.idle().drain(..).collect();
        for idle in &drained {
            idle.transport.close();
        }
        drained.len()
    }
}

/// Bounded, lazily connected transport pools keyed by server address.
///
/// Borrowing never exceeds `max_active` transports per server. When a server
/// is at capacity up to `max_pending` borrowers wait; more are refused.
pub struct TransportPool {
    factory: TransportFactory,
    config: PoolConfig,
    servers: Mutex<HashMap<ServerAddress, Arc<ServerPool>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPool")
            .field("config", &self.config)
            .field("servers", &self.servers().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TransportPool {
    /// Creates an empty pool. Nothing is connected until the first borrow.
    pub fn new(factory: TransportFactory, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            servers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the factory used for new transports.
    pub fn factory(&self) -> &TransportFactory {
        &self.factory
    }

    /// Borrows a transport to `address`, connecting one if none is idle.
    ///
    /// Idle transports past the idle timeout are closed; those idle longer
    /// than the health-check threshold are pinged first and discarded
    /// silently if the ping fails.
    #[instrument(name = "transport_pool.borrow", skip(self), fields(address = %address))]
    pub async fn borrow(&self, address: &ServerAddress) -> Result<PooledTransport> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HotRodError::Closed("transport pool closed".to_string()));
        }
        let server = self.server(address);
        let permit = self.acquire(&server).await?;

        loop {
            // The idle-queue guard must not live across the health-check ping.
            let next = server.idle().pop_front();
            let Some(idle) = next else {
                break;
            };
            let idle_for = idle.idle_since.elapsed();
            if idle.transport.is_closed() {
                continue;
            }
            let idle_timeout = self.config.idle_timeout();
            if !idle_timeout.is_zero() && idle_for > idle_timeout {
                tracing::debug!(idle_ms = idle_for.as_millis() as u64, "closing idle transport");
                idle.transport.close();
                continue;
            }
            if idle_for > self.config.health_check_threshold() {
                if let Err(e) = idle.transport.ping(HEALTH_CHECK_TIMEOUT).await {
                    tracing::debug!(error = %e, "idle transport failed health check");
                    idle.transport.close();
                    continue;
                }
            }
            return Ok(PooledTransport::new(idle.transport, permit, server));
        }

        let transport = self.factory.connect(address).await?;
        Ok(PooledTransport::new(transport, permit, server))
    }

    /// Returns a transport to its pool.
    ///
    /// Equivalent to dropping it; closed transports are discarded.
    pub fn release(&self, transport: PooledTransport) {
        drop(transport);
    }

    /// Closes every idle transport to `address`.
    ///
    /// Borrowed transports are closed as they come back if they failed;
    /// healthy ones return to the pool.
    pub fn evict(&self, address: &ServerAddress) {
        let server = self.servers().get(address).cloned();
        if let Some(server) = server {
            let closed = server.close_idle();
            tracing::warn!(address = %address, closed, "evicted server transports");
        }
    }

    /// Drops the pools of servers not in `live`.
    pub fn retain_servers(&self, live: &[ServerAddress]) {
        let removed: Vec<Arc<ServerPool>> = {
            let mut servers = self.servers();
            let stale: Vec<ServerAddress> = servers
                .keys()
                .filter(|address| !live.contains(address))
                .cloned()
                .collect();
            stale.iter().filter_map(|a| servers.remove(a)).collect()
        };
        for server in removed {
            tracing::debug!(address = %server.address, "dropping pool of departed server");
            server.close_idle();
        }
    }

    /// Closes every pool; waiting and future borrows fail with `Closed`.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let servers: Vec<Arc<ServerPool>> = self.servers().drain().map(|(_, s)| s).collect();
        for server in servers {
            server.permits.close();
            server.close_idle();
        }
    }

    /// Returns the number of idle transports to `address`.
    pub fn idle_count(&self, address: &ServerAddress) -> usize {
        self.servers()
            .get(address)
            .map(|s| s.idle().len())
            .unwrap_or(0)
    }

    /// Returns the number of borrowed transports to `address`.
    pub fn active_count(&self, address: &ServerAddress) -> usize {
        self.servers()
            .get(address)
            .map(|s| self.config.max_active() as usize - s.permits.available_permits())
            .unwrap_or(0)
    }

    /// Returns the addresses with a pool.
    pub fn addresses(&self) -> Vec<ServerAddress> {
        self.servers().keys().cloned().collect()
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<ServerAddress, Arc<ServerPool>>> {
        self.servers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn server(&self, address: &ServerAddress) -> Arc<ServerPool> {
        let mut servers = self.servers();
        Arc::clone(servers.entry(address.clone()).or_insert_with(|| {
            Arc::new(ServerPool::new(address.clone(), self.config.max_active()))
        }))
    }

    async fn acquire(&self, server: &Arc<ServerPool>) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&server.permits).try_acquire_owned() {
            return Ok(permit);
        }

        let waiting = server.waiting.fetch_add(1, Ordering::SeqCst);
        if waiting >= self.config.max_pending() {
            server.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(HotRodError::Connection(format!(
                "too many requests waiting for a connection to {}",
                server.address
            )));
        }
        let permit = Arc::clone(&server.permits).acquire_owned().await;
        server.waiting.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| HotRodError::Closed("transport pool closed".to_string()))
    }
}

impl Drop for TransportPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// A borrowed transport. Returns to its pool when dropped.
pub struct PooledTransport {
    transport: Option<Transport>,
    server: Arc<ServerPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledTransport {
    fn new(transport: Transport, permit: OwnedSemaphorePermit, server: Arc<ServerPool>) -> Self {
        Self {
            transport: Some(transport),
            server,
            _permit: permit,
        }
    }

    /// Closes the transport instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
    }
}

impl Deref for PooledTransport {
    type Target = Transport;

    fn deref(&self) -> &Transport {
        // Only `discard` and `drop` take the transport, and both consume self.
        match &self.transport {
            Some(transport) => transport,
            None => unreachable!("pooled transport used after release"),
        }
    }
}

impl std::fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTransport")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        if transport.is_closed() || self.server.permits.is_closed() {
            return;
        }
        self.server.idle().push_back(IdleTransport {
            transport,
            idle_since: Instant::now(),
        });
    }
}
