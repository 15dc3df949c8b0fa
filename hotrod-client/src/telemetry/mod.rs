//! Pluggable observation hooks for the dispatcher, pool and near-cache.
//!
//! A `Telemetry` implementation is handed to the client at construction and
//! shared by every component; nothing is registered globally. The default is
//! [`NoopTelemetry`].

mod slow_ops;

pub use slow_ops::SlowOperationTelemetry;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use hotrod_core::{HotRodError, ServerAddress};

/// Receives client events. Every method defaults to doing nothing.
pub trait Telemetry: Send + Sync + Debug {
    /// A logical call finished, successfully or not, after all its attempts.
    fn operation_completed(&self, _operation: &'static str, _duration: Duration, _succeeded: bool) {}

    /// An attempt failed with a recoverable error and will be retried.
    fn operation_retried(&self, _operation: &'static str, _attempt: u32, _error: &HotRodError) {}

    /// A newer topology was installed for a cache.
    fn topology_installed(&self, _cache_name: &str, _topology_id: u64) {}

    /// A transport was connected.
    fn connection_opened(&self, _address: &ServerAddress) {}

    /// A transport was closed.
    fn connection_closed(&self, _address: &ServerAddress) {}

    /// A near-cache lookup hit.
    fn near_cache_hit(&self, _cache_name: &str) {}

    /// A near-cache lookup missed.
    fn near_cache_miss(&self, _cache_name: &str) {}
}

/// Telemetry that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

/// Forwards every event to several sinks.
#[derive(Debug, Default, Clone)]
pub struct CompositeTelemetry {
    sinks: Vec<Arc<dyn Telemetry>>,
}

impl CompositeTelemetry {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with(mut self, sink: Arc<dyn Telemetry>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Telemetry for CompositeTelemetry {
    fn operation_completed(&self, operation: &'static str, duration: Duration, succeeded: bool) {
        for sink in &self.sinks {
            sink.operation_completed(operation, duration, succeeded);
        }
    }

    fn operation_retried(&self, operation: &'static str, attempt: u32, error: &HotRodError) {
        for sink in &self.sinks {
            sink.operation_retried(operation, attempt, error);
        }
    }

    fn topology_installed(&self, cache_name: &str, topology_id: u64) {
        for sink in &self.sinks {
            sink.topology_installed(cache_name, topology_id);
        }
    }

    fn connection_opened(&self, address: &ServerAddress) {
        for sink in &self.sinks {
            sink.connection_opened(address);
        }
    }

    fn connection_closed(&self, address: &ServerAddress) {
        for sink in &self.sinks {
            sink.connection_closed(address);
        }
    }

    fn near_cache_hit(&self, cache_name: &str) {
        for sink in &self.sinks {
            sink.near_cache_hit(cache_name);
        }
    }

    fn near_cache_miss(&self, cache_name: &str) {
        for sink in &self.sinks {
            sink.near_cache_miss(cache_name);
        }
    }
}

/// Short error label for counters.
pub(crate) fn error_kind(error: &HotRodError) -> &'static str {
    match error {
        HotRodError::Connection(_) => "connection",
        HotRodError::ProtocolDesync(_) => "desync",
        HotRodError::Protocol(_) => "protocol",
        HotRodError::Server { .. } => "server",
        HotRodError::TopologyStale { .. } => "topology_stale",
        HotRodError::Timeout(_) => "timeout",
        HotRodError::RetriesExhausted { .. } => "retries_exhausted",
        HotRodError::Configuration(_) => "configuration",
        HotRodError::Closed(_) => "closed",
        HotRodError::Io(_) => "io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct Counting {
        completed: AtomicU64,
        topologies: AtomicU64,
    }

    impl Telemetry for Counting {
        fn operation_completed(&self, _: &'static str, _: Duration, _: bool) {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }

        fn topology_installed(&self, _: &str, _: u64) {
            self.topologies.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_noop_accepts_everything() {
        let telemetry = NoopTelemetry;
        telemetry.operation_completed("get", Duration::from_millis(1), true);
        telemetry.connection_opened(&ServerAddress::new("a", 1));
        telemetry.near_cache_miss("c");
    }

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let composite = CompositeTelemetry::new().with(a.clone()).with(b.clone());

        composite.operation_completed("put", Duration::ZERO, true);
        composite.topology_installed("c", 2);

        assert_eq!(a.completed.load(Ordering::Relaxed), 1);
        assert_eq!(b.completed.load(Ordering::Relaxed), 1);
        assert_eq!(b.topologies.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(error_kind(&HotRodError::Timeout("t".into())), "timeout");
        assert_eq!(
            error_kind(&HotRodError::TopologyStale {
                status: 0x87,
                message: String::new()
            }),
            "topology_stale"
        );
    }
}
