//! Aggregate execution counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::analyzer::Strategy;
use crate::error::ErrorKind;

const KINDS: [ErrorKind; 11] = [
    ErrorKind::Validation,
    ErrorKind::Security,
    ErrorKind::SyntaxNotSupported,
    ErrorKind::Syntax,
    ErrorKind::Concurrency,
    ErrorKind::Timeout,
    ErrorKind::Runtime,
    ErrorKind::Reference,
    ErrorKind::Type,
    ErrorKind::ResourceExhausted,
    ErrorKind::MemoryLimit,
];

fn kind_index(kind: ErrorKind) -> usize {
    KINDS.iter().position(|k| *k == kind).unwrap_or(0)
}

/// Lock-free execution counters.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    current: AtomicU64,
    latency_micros: AtomicU64,
    pool: AtomicU64,
    event_loop: AtomicU64,
    errors: [AtomicU64; KINDS.len()],
}

/// Point-in-time copy of [`ExecutorStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Requests received.
    pub total: u64,
    /// Requests that returned a result.
    pub success: u64,
    /// Requests that returned an error.
    pub failed: u64,
    /// Requests in flight.
    pub current: u64,
    /// Mean latency of finished requests, in milliseconds.
    pub avg_latency_ms: f64,
    /// Executions dispatched to the pool path.
    pub pool_executions: u64,
    /// Executions dispatched to the event-loop path.
    pub event_loop_executions: u64,
    /// Failures by kind; kinds never seen are omitted.
    pub errors: Vec<(ErrorKind, u64)>,
}

impl ExecutorStats {
    /// A request arrived.
    pub fn begin(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    /// A compiled program was handed to `path`.
    pub fn dispatched(&self, path: Strategy) {
        let counter = match path {
            Strategy::Pool => &self.pool,
            Strategy::EventLoop => &self.event_loop,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A request finished; `error` is its failure kind, if any.
    pub fn finish(&self, elapsed: Duration, error: Option<ErrorKind>) {
        self.current.fetch_sub(1, Ordering::AcqRel);
        self.latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        match error {
            None => {
                self.success.fetch_add(1, Ordering::Relaxed);
            }
            Some(kind) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.errors[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let success = self.success.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = success + failed;
        let latency = self.latency_micros.load(Ordering::Relaxed);
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success,
            failed,
            current: self.current.load(Ordering::Acquire),
            avg_latency_ms: if finished == 0 {
                0.0
            } else {
                latency as f64 / finished as f64 / 1_000.0
            },
            pool_executions: self.pool.load(Ordering::Relaxed),
            event_loop_executions: self.event_loop.load(Ordering::Relaxed),
            errors: KINDS
                .iter()
                .zip(&self.errors)
                .map(|(kind, n)| (*kind, n.load(Ordering::Relaxed)))
                .filter(|(_, n)| *n > 0)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_outcomes() {
        let stats = ExecutorStats::default();
        stats.begin();
        stats.begin();
        stats.dispatched(Strategy::Pool);
        stats.finish(Duration::from_millis(10), None);
        let mid = stats.snapshot();
        assert_eq!(mid.current, 1);

        stats.finish(Duration::from_millis(30), Some(ErrorKind::Timeout));
        let snap = stats.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.success, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.current, 0);
        assert_eq!(snap.pool_executions, 1);
        assert_eq!(snap.event_loop_executions, 0);
        assert!((snap.avg_latency_ms - 20.0).abs() < 1e-9);
        assert_eq!(snap.errors, vec![(ErrorKind::Timeout, 1)]);
    }

    #[test]
    fn every_kind_has_a_slot() {
        for (i, kind) in KINDS.iter().enumerate() {
            assert_eq!(kind_index(*kind), i);
        }
    }
}
