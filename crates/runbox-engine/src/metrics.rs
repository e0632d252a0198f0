//! Prometheus metrics for the runbox engine.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PathLabels {
    /// The execution path: "pool" or "event_loop".
    pub path: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The error kind, e.g. "TimeoutError".
    pub kind: String,
}

/// Prometheus metrics for the engine.
pub struct RunboxMetrics {
    /// Executions by path.
    pub executions_total: Family<PathLabels, Counter>,
    /// Execution duration in seconds, by path.
    pub execution_duration_seconds: Family<PathLabels, Histogram>,
    /// Errors by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Live pooled runtimes.
    pub pool_runtimes: Gauge<i64, AtomicI64>,
}

impl RunboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "runbox_executions_total",
            "Total executions by path",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<PathLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter())
            });
        registry.register(
            "runbox_execution_duration_seconds",
            "Execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "runbox_errors_total",
            "Total execution errors by kind",
            errors_total.clone(),
        );

        let pool_runtimes = Gauge::default();
        registry.register(
            "runbox_pool_runtimes",
            "Live runtimes in the pool",
            pool_runtimes.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
            pool_runtimes,
        }
    }

    /// Record a finished execution on `path`.
    pub fn record_execution(&self, path: &str, duration_secs: f64) {
        let labels = PathLabels {
            path: path.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record an error of `kind`.
    pub fn record_error(&self, kind: &str) {
        let labels = ErrorLabels {
            kind: kind.to_string(),
        };
        self.errors_total.get_or_create(&labels).inc();
    }

    /// Publish the current pool size.
    pub fn set_pool_runtimes(&self, size: usize) {
        self.pool_runtimes.set(size as i64);
    }
}
