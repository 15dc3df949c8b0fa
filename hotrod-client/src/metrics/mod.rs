//! Prometheus metrics for the Hot Rod client.
//!
//! Enable the `metrics` feature flag to use this module. Hand a
//! [`PrometheusTelemetry`] to the client builder and scrape its registry.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hotrod_client::metrics::PrometheusTelemetry;
//!
//! let metrics = Arc::new(PrometheusTelemetry::new("myapp")?);
//! let manager = RemoteCacheManager::builder(config)
//!     .telemetry(metrics.clone())
//!     .build()
//!     .await?;
//!
//! let text = metrics.encode_text()?;
//! ```

use std::time::Duration;

use hotrod_core::{HotRodError, ServerAddress};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::telemetry::{error_kind, Telemetry};

/// Prometheus-backed telemetry.
///
/// Tracks:
/// - open connections and connections opened since start
/// - operation counts and latencies by operation and outcome
/// - retries by error kind
/// - topology installs
/// - near-cache hits and misses by cache
#[derive(Clone)]
pub struct PrometheusTelemetry {
    registry: Registry,
    connections_active: IntGauge,
    connections_total: IntCounter,
    operations_total: IntCounterVec,
    operation_duration_seconds: HistogramVec,
    retries_total: IntCounterVec,
    topology_updates_total: IntCounterVec,
    near_cache_lookups_total: IntCounterVec,
}

impl PrometheusTelemetry {
    /// Creates the metrics with the given name prefix.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError` if a metric cannot be created or registered,
    /// which happens for an invalid prefix.
    pub fn new(prefix: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let connections_active = IntGauge::with_opts(Opts::new(
            format!("{}_connections_active", prefix),
            "Number of currently open connections",
        ))
        .map_err(MetricsError::from_prometheus)?;

        let connections_total = IntCounter::with_opts(Opts::new(
            format!("{}_connections_total", prefix),
            "Total number of connections opened since client start",
        ))
        .map_err(MetricsError::from_prometheus)?;

        let operations_total = IntCounterVec::new(
            Opts::new(
                format!("{}_operations_total", prefix),
                "Total number of operations by type and outcome",
            ),
            &["operation", "outcome"],
        )
        .map_err(MetricsError::from_prometheus)?;

        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_operation_duration_seconds", prefix),
                "Operation duration in seconds, including retries",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["operation"],
        )
        .map_err(MetricsError::from_prometheus)?;

        let retries_total = IntCounterVec::new(
            Opts::new(
                format!("{}_retries_total", prefix),
                "Total number of retried attempts by error kind",
            ),
            &["operation", "error_kind"],
        )
        .map_err(MetricsError::from_prometheus)?;

        let topology_updates_total = IntCounterVec::new(
            Opts::new(
                format!("{}_topology_updates_total", prefix),
                "Total number of topologies installed by cache",
            ),
            &["cache"],
        )
        .map_err(MetricsError::from_prometheus)?;

        let near_cache_lookups_total = IntCounterVec::new(
            Opts::new(
                format!("{}_near_cache_lookups_total", prefix),
                "Near-cache lookups by cache and result",
            ),
            &["cache", "result"],
        )
        .map_err(MetricsError::from_prometheus)?;

        let metrics = Self {
            registry,
            connections_active,
            connections_total,
            operations_total,
            operation_duration_seconds,
            retries_total,
            topology_updates_total,
            near_cache_lookups_total,
        };
        metrics.register_all()?;
        Ok(metrics)
    }

    fn register_all(&self) -> Result<(), MetricsError> {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(self.connections_active.clone()),
            Box::new(self.connections_total.clone()),
            Box::new(self.operations_total.clone()),
            Box::new(self.operation_duration_seconds.clone()),
            Box::new(self.retries_total.clone()),
            Box::new(self.topology_updates_total.clone()),
            Box::new(self.near_cache_lookups_total.clone()),
        ];
        for collector in collectors {
            self.registry
                .register(collector)
                .map_err(MetricsError::from_prometheus)?;
        }
        Ok(())
    }

    /// Returns the current number of open connections.
    pub fn active_connections(&self) -> i64 {
        self.connections_active.get()
    }

    /// Returns the total number of connections opened.
    pub fn total_connections(&self) -> u64 {
        self.connections_total.get()
    }

    /// Gathers all metric families for Prometheus exposition.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encodes all metrics in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.gather(), &mut buffer)
            .map_err(|e| MetricsError::new(format!("encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::new(format!("invalid UTF-8: {}", e)))
    }

    /// Returns the underlying registry, for registering custom metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Telemetry for PrometheusTelemetry {
    fn operation_completed(&self, operation: &'static str, duration: Duration, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failure" };
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    fn operation_retried(&self, operation: &'static str, _attempt: u32, error: &HotRodError) {
        self.retries_total
            .with_label_values(&[operation, error_kind(error)])
            .inc();
    }

    fn topology_installed(&self, cache_name: &str, _topology_id: u64) {
        self.topology_updates_total
            .with_label_values(&[cache_name])
            .inc();
    }

    fn connection_opened(&self, _address: &ServerAddress) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    fn connection_closed(&self, _address: &ServerAddress) {
        self.connections_active.dec();
    }

    fn near_cache_hit(&self, cache_name: &str) {
        self.near_cache_lookups_total
            .with_label_values(&[cache_name, "hit"])
            .inc();
    }

    fn near_cache_miss(&self, cache_name: &str) {
        self.near_cache_lookups_total
            .with_label_values(&[cache_name, "miss"])
            .inc();
    }
}

impl std::fmt::Debug for PrometheusTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusTelemetry")
            .field("connections_active", &self.connections_active.get())
            .field("connections_total", &self.connections_total.get())
            .finish_non_exhaustive()
    }
}

/// Error type for metrics operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsError {
    message: String,
}

impl MetricsError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn from_prometheus(err: prometheus::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "metrics error: {}", self.message)
    }
}

impl std::error::Error for MetricsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_gauge() {
        let metrics = PrometheusTelemetry::new("test").unwrap();
        let address = ServerAddress::new("a", 11222);

        metrics.connection_opened(&address);
        metrics.connection_opened(&address);
        metrics.connection_closed(&address);

        assert_eq!(metrics.active_connections(), 1);
        assert_eq!(metrics.total_connections(), 2);
    }

    #[test]
    fn test_operations_are_labelled() {
        let metrics = PrometheusTelemetry::new("test").unwrap();
        metrics.operation_completed("get", Duration::from_millis(3), true);
        metrics.operation_completed("get", Duration::from_millis(3), false);
        metrics.operation_retried(
            "get",
            1,
            &HotRodError::Connection("reset".into()),
        );
        metrics.near_cache_hit("users");

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("test_operations_total{operation=\"get\",outcome=\"success\"} 1"));
        assert!(text.contains("test_operations_total{operation=\"get\",outcome=\"failure\"} 1"));
        assert!(text.contains("error_kind=\"connection\""));
        assert!(text.contains("test_near_cache_lookups_total{cache=\"users\",result=\"hit\"} 1"));
    }

    #[test]
    fn test_invalid_prefix_is_an_error() {
        assert!(PrometheusTelemetry::new("bad prefix").is_err());
    }

    #[test]
    fn test_metrics_error_display() {
        let err = MetricsError::new("boom");
        assert_eq!(err.to_string(), "metrics error: boom");
    }
}
