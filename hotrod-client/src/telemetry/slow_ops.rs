//! Slow operation detection and logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::Telemetry;

/// Logs operations slower than a threshold.
///
/// Emits a `tracing` warning for each slow call and keeps counters that can
/// be polled for health checks.
#[derive(Debug)]
pub struct SlowOperationTelemetry {
    threshold: Duration,
    total_operations: AtomicU64,
    slow_operations: AtomicU64,
    failed_operations: AtomicU64,
}

impl SlowOperationTelemetry {
    /// Creates a detector with the specified threshold.
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            total_operations: AtomicU64::new(0),
            slow_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
        }
    }

    /// Returns the configured slow operation threshold.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Returns the total number of operations observed.
    pub fn total_operations(&self) -> u64 {
        self.total_operations.load(Ordering::Relaxed)
    }

    /// Returns the number of slow operations detected.
    pub fn slow_operations(&self) -> u64 {
        self.slow_operations.load(Ordering::Relaxed)
    }

    /// Returns the number of operations that ended in an error.
    pub fn failed_operations(&self) -> u64 {
        self.failed_operations.load(Ordering::Relaxed)
    }

    /// Resets the counters.
    pub fn reset(&self) {
        self.total_operations.store(0, Ordering::Relaxed);
        self.slow_operations.store(0, Ordering::Relaxed);
        self.failed_operations.store(0, Ordering::Relaxed);
    }
}

impl Telemetry for SlowOperationTelemetry {
    fn operation_completed(&self, operation: &'static str, duration: Duration, succeeded: bool) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
        }
        if duration > self.threshold {
            self.slow_operations.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                operation,
                duration_ms = duration.as_millis() as u64,
                threshold_ms = self.threshold.as_millis() as u64,
                succeeded,
                "slow operation detected"
            );
        }
    }
}
