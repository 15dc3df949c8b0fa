//! Routes operations to servers and retries recoverable failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hotrod_core::protocol::{RequestFrame, Response};
use hotrod_core::{HotRodError, Result, ServerAddress};
use rand::Rng;
use tracing::instrument;

use crate::config::RetryConfig;
use crate::connection::{next_message_id, Transport, TransportPool};
use crate::operation::Operation;
use crate::routing::ConsistentHashRouter;
use crate::telemetry::{error_kind, Telemetry};

/// Calculates the next backoff duration with jitter applied.
pub(crate) fn calculate_backoff_with_jitter(
    current_backoff: Duration,
    multiplier: f64,
    max_backoff: Duration,
    jitter: f64,
) -> Duration {
    let base_backoff = current_backoff.as_secs_f64() * multiplier;

    let jitter_factor = if jitter > 0.0 {
        let mut rng = rand::thread_rng();
        1.0 + rng.gen_range(-jitter..=jitter)
    } else {
        1.0
    };

    let jittered_backoff = base_backoff * jitter_factor;

    std::cmp::min(Duration::from_secs_f64(jittered_backoff), max_backoff)
}

/// Sends operations to the servers that own their keys.
///
/// Each call is bounded by one deadline covering every attempt. Recoverable
/// failures (connection errors, desyncs, stale-topology statuses) are retried
/// up to `max_retries` times with a fresh message id and fresh routing; any
/// other error ends the call at once.
#[derive(Debug)]
pub struct Dispatcher {
    router: Arc<ConsistentHashRouter>,
    pool: Arc<TransportPool>,
    retry: RetryConfig,
    socket_timeout: Duration,
    telemetry: Arc<dyn Telemetry>,
    pruned_generation: AtomicU64,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        router: Arc<ConsistentHashRouter>,
        pool: Arc<TransportPool>,
        retry: RetryConfig,
        socket_timeout: Duration,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            router,
            pool,
            retry,
            socket_timeout,
            telemetry,
            pruned_generation: AtomicU64::new(0),
        }
    }

    /// Returns the router.
    pub fn router(&self) -> &Arc<ConsistentHashRouter> {
        &self.router
    }

    /// Returns the transport pool.
    pub fn pool(&self) -> &Arc<TransportPool> {
        &self.pool
    }

    /// Returns the telemetry sink.
    pub fn telemetry(&self) -> &Arc<dyn Telemetry> {
        &self.telemetry
    }

    /// Returns the per-call deadline.
    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    /// Executes an operation on the owners of its key, or any server for
    /// keyless operations.
    #[instrument(
        name = "dispatcher.execute",
        skip(self, operation),
        fields(operation = operation.name(), cache = operation.cache_name())
    )]
    pub async fn execute<T>(&self, operation: &Operation<T>) -> Result<T> {
        self.run(operation, None).await
    }

    /// Executes an operation on one specific server.
    ///
    /// Used where the server holds state for the caller, such as an open
    /// iteration. Retries stay on that server.
    #[instrument(
        name = "dispatcher.execute_on",
        skip(self, operation),
        fields(operation = operation.name(), address = %address)
    )]
    pub async fn execute_on<T>(&self, address: &ServerAddress, operation: &Operation<T>) -> Result<T> {
        self.run(operation, Some(address)).await
    }

    /// Executes an operation once on a transport the caller owns.
    ///
    /// Applies topology updates and maps error statuses like `execute`, but
    /// never retries.
    pub async fn execute_on_transport<T>(
        &self,
        transport: &Transport,
        operation: &Operation<T>,
    ) -> Result<T> {
        tokio::time::timeout(self.socket_timeout, self.exchange(transport, operation))
            .await
            .map_err(|_| {
                HotRodError::Timeout(format!(
                    "{} on {} timed out after {:?}",
                    operation.name(),
                    transport.address(),
                    self.socket_timeout
                ))
            })?
    }

    async fn run<T>(&self, operation: &Operation<T>, target: Option<&ServerAddress>) -> Result<T> {
        let started = Instant::now();
        let deadline = started + self.socket_timeout;
        let max_attempts = self.retry.max_retries().saturating_add(1);
        let mut backoff = self.retry.initial_backoff();
        let mut failed: Vec<ServerAddress> = Vec::new();
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            self.prune_departed_servers();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(self.timeout_error(operation));
            }

            let mut candidates = match target {
                Some(address) => vec![address.clone()],
                None => self.router.candidates(
                    operation.cache_name(),
                    operation.routing_key().map(|k| &k[..]),
                ),
            };
            // Servers that already failed this call go last.
            candidates.sort_by_key(|c| failed.contains(c));

            let outcome =
                tokio::time::timeout(remaining, self.attempt(operation, &candidates, &mut failed))
                    .await;
            let error = match outcome {
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(e)) => e,
                Err(_) => break Err(self.timeout_error(operation)),
            };

            if !error.is_retryable() {
                break Err(error);
            }
            if attempt >= max_attempts {
                break Err(HotRodError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            tracing::warn!(
                operation = operation.name(),
                attempt,
                error_kind = error_kind(&error),
                error = %error,
                backoff = ?backoff,
                "retrying operation"
            );
            self.telemetry
                .operation_retried(operation.name(), attempt, &error);

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = calculate_backoff_with_jitter(
                backoff,
                self.retry.multiplier(),
                self.retry.max_backoff(),
                self.retry.jitter(),
            );
        };

        self.telemetry
            .operation_completed(operation.name(), started.elapsed(), result.is_ok());
        result
    }

    /// One attempt: the first reachable candidate gets the request.
    async fn attempt<T>(
        &self,
        operation: &Operation<T>,
        candidates: &[ServerAddress],
        failed: &mut Vec<ServerAddress>,
    ) -> Result<T> {
        let mut last_error = None;
        for address in candidates {
            let transport = match self.pool.borrow(address).await {
                Ok(transport) => transport,
                Err(e @ HotRodError::Closed(_)) => return Err(e),
                Err(e) => {
                    tracing::debug!(address = %address, error = %e, "server unreachable, trying next");
                    failed.push(address.clone());
                    last_error = Some(e);
                    continue;
                }
            };

            tracing::trace!(address = %address, transport = %transport.id(), "sending");
            return match self.exchange(&transport, operation).await {
                Ok(value) => Ok(value),
                Err(e) => {
                    if e.is_connection_fatal() || transport.is_closed() {
                        transport.discard();
                        self.pool.evict(address);
                    }
                    if e.is_retryable() {
                        failed.push(address.clone());
                    }
                    Err(e)
                }
            };
        }
        Err(last_error.unwrap_or_else(|| {
            HotRodError::Connection(format!(
                "no server available for cache '{}'",
                operation.cache_name()
            ))
        }))
    }

    async fn exchange<T>(&self, transport: &Transport, operation: &Operation<T>) -> Result<T> {
        let cache_name = operation.cache_name();
        let frame = RequestFrame {
            message_id: next_message_id(),
            topology_id: self.router.topology_id(cache_name),
            request: operation.request().clone(),
        };
        let response = transport.execute(frame).await?;
        let response = self.accept_response(cache_name, response)?;
        operation.decode(response)
    }

    /// Installs any topology the response carries, then maps error statuses.
    fn accept_response(&self, cache_name: &str, mut response: Response) -> Result<Response> {
        if let Some(topology) = response.header.topology.take() {
            let topology_id = topology.id();
            if self.router.apply_topology(cache_name, topology) {
                self.telemetry.topology_installed(cache_name, topology_id);
            }
        }

        let status = response.status();
        if status.is_topology_stale() {
            return Err(HotRodError::TopologyStale {
                status: status.raw(),
                message: response.error_message().unwrap_or_default().to_string(),
            });
        }
        if status.is_error() {
            return Err(HotRodError::Server {
                status: status.raw(),
                message: response.error_message().unwrap_or_default().to_string(),
            });
        }
        Ok(response)
    }

    /// Closes pooled transports of servers that left every topology.
    ///
    /// Runs on the first call after a topology install rather than at the
    /// install itself.
    fn prune_departed_servers(&self) {
        let generation = self.router.generation();
        if self.pruned_generation.swap(generation, Ordering::SeqCst) != generation {
            self.pool.retain_servers(&self.router.all_servers());
        }
    }

    fn timeout_error<T>(&self, operation: &Operation<T>) -> HotRodError {
        HotRodError::Timeout(format!(
            "{} on cache '{}' did not complete within {:?}",
            operation.name(),
            operation.cache_name(),
            self.socket_timeout
        ))
    }
}
