//! Circuit breaker guarding the execution engine's health.
//!
//! Tracks execution outcomes in rolling windows. When enough samples show a
//! high failure ratio the circuit opens and every request is rejected until
//! `open_timeout` elapses. It then half-opens and lets a bounded number of
//! trials through: enough consecutive successes close it, any failure
//! re-opens it. A half-open circuit that has not reached a verdict within
//! another `open_timeout` re-opens, so lost trials cannot hold it forever.
//!
//! Every state change starts a new generation. Outcomes recorded against a
//! ticket from an older generation are ignored, so a slow execution admitted
//! before the circuit opened cannot close it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ExecutionError;

/// Configuration for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Samples required in the current window before the circuit may open.
    pub min_requests: u32,
    /// Failure ratio (0, 1] at or above which the circuit opens.
    pub failure_ratio: f64,
    /// Length of a rolling window while closed.
    pub interval: Duration,
    /// How long the circuit stays open before probing.
    pub open_timeout: Duration,
    /// Trials admitted while half-open, and consecutive successes needed to
    /// close.
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 20,
            failure_ratio: 0.5,
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow; outcomes are counted.
    Closed,
    /// Requests are rejected.
    Open,
    /// A bounded number of trials are admitted.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Counts for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Requests admitted.
    pub requests: u32,
    /// Outcomes recorded as successes.
    pub successes: u32,
    /// Outcomes recorded as failures.
    pub failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn samples(&self) -> u32 {
        self.successes + self.failures
    }
}

/// Proof of admission; hand it back to [`CircuitBreaker::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTicket {
    generation: u64,
}

/// Point-in-time breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Current generation.
    pub generation: u64,
    /// Counts for the current generation.
    pub counts: Counts,
    /// Milliseconds until the open circuit half-opens, when open.
    pub retry_after_ms: Option<u64>,
    /// Total state transitions since creation.
    pub transitions: u64,
}

struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// End of the current window (closed) or of the open period (open).
    expiry: Option<Instant>,
    transitions: u64,
}

/// Generation-counting circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        let expiry = window_end(&config, Instant::now());
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
                transitions: 0,
            }),
        }
    }

    /// Ask to run one request.
    ///
    /// Returns [`ExecutionError::CircuitOpen`] while open, or while half-open
    /// with all trial slots taken.
    pub fn allow(&self) -> Result<BreakerTicket, ExecutionError> {
        let now = Instant::now();
        let mut st = self.state.lock();
        self.refresh(&mut st, now);

        match st.state {
            CircuitState::Open => {
                let retry_after = st
                    .expiry
                    .map(|e| e.saturating_duration_since(now))
                    .unwrap_or_default();
                Err(ExecutionError::CircuitOpen {
                    retry_after_ms: retry_after.as_millis() as u64,
                })
            }
            CircuitState::HalfOpen if st.counts.requests >= self.config.half_open_max_requests => {
                Err(ExecutionError::CircuitOpen { retry_after_ms: 0 })
            }
            CircuitState::Closed | CircuitState::HalfOpen => {
                st.counts.requests += 1;
                Ok(BreakerTicket {
                    generation: st.generation,
                })
            }
        }
    }

    /// Hand back a ticket whose request never ran.
    ///
    /// Frees the admission (or trial slot) without counting an outcome.
    pub fn release(&self, ticket: BreakerTicket) {
        let mut st = self.state.lock();
        self.refresh(&mut st, Instant::now());
        if ticket.generation == st.generation {
            st.counts.requests = st.counts.requests.saturating_sub(1);
        }
    }

    /// Record the outcome of an admitted request.
    pub fn record(&self, ticket: BreakerTicket, success: bool) {
        let now = Instant::now();
        let mut st = self.state.lock();
        self.refresh(&mut st, now);
        if ticket.generation != st.generation {
            return;
        }

        match (st.state, success) {
            (CircuitState::Closed, true) => st.counts.on_success(),
            (CircuitState::Closed, false) => {
                st.counts.on_failure();
                let samples = st.counts.samples();
                let ratio = f64::from(st.counts.failures) / f64::from(samples.max(1));
                if samples >= self.config.min_requests && ratio >= self.config.failure_ratio {
                    tracing::warn!(
                        samples,
                        failures = st.counts.failures,
                        ratio,
                        "circuit breaker opened"
                    );
                    self.transition(&mut st, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, true) => {
                st.counts.on_success();
                if st.counts.consecutive_successes >= self.config.half_open_max_requests {
                    tracing::info!("circuit breaker closed after successful trials");
                    self.transition(&mut st, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, false) => {
                tracing::warn!("circuit breaker re-opened after failed trial");
                self.transition(&mut st, CircuitState::Open, now);
            }
            (CircuitState::Open, _) => {}
        }
    }

    /// Current state, applying any due time-based transition.
    pub fn state(&self) -> CircuitState {
        let mut st = self.state.lock();
        self.refresh(&mut st, Instant::now());
        st.state
    }

    /// Snapshot for health reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut st = self.state.lock();
        self.refresh(&mut st, now);
        BreakerSnapshot {
            state: st.state,
            generation: st.generation,
            counts: st.counts,
            retry_after_ms: match st.state {
                CircuitState::Open => st
                    .expiry
                    .map(|e| e.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
            transitions: st.transitions,
        }
    }

    /// Apply time-based transitions: roll the closed window, half-open an
    /// expired open circuit, re-open a half-open circuit that stalled.
    fn refresh(&self, st: &mut BreakerState, now: Instant) {
        let expired = st.expiry.is_some_and(|e| e <= now);
        match st.state {
            CircuitState::Closed if expired => {
                st.generation += 1;
                st.counts = Counts::default();
                st.expiry = window_end(&self.config, now);
            }
            CircuitState::Open if expired => {
                tracing::info!("circuit breaker half-open, allowing trials");
                self.transition(st, CircuitState::HalfOpen, now);
            }
            CircuitState::HalfOpen if expired => {
                tracing::warn!(
                    trials = st.counts.requests,
                    recorded = st.counts.samples(),
                    "circuit breaker trials unresolved, re-opening"
                );
                self.transition(st, CircuitState::Open, now);
            }
            _ => {}
        }
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState, now: Instant) {
        st.state = to;
        st.generation += 1;
        st.transitions += 1;
        st.counts = Counts::default();
        st.expiry = match to {
            CircuitState::Closed => window_end(&self.config, now),
            CircuitState::Open | CircuitState::HalfOpen => Some(now + self.config.open_timeout),
        };
    }
}

fn window_end(config: &BreakerConfig, now: Instant) -> Option<Instant> {
    (!config.interval.is_zero()).then(|| now + config.interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            min_requests: 4,
            failure_ratio: 0.5,
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_millis(50),
            half_open_max_requests: 2,
        }
    }

    fn fail_n(cb: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            let t = cb.allow().unwrap();
            cb.record(t, false);
        }
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let cb = CircuitBreaker::new(config());
        fail_n(&cb, 3);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn stays_closed_below_failure_ratio() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..6 {
            let t = cb.allow().unwrap();
            cb.record(t, true);
        }
        fail_n(&cb, 3);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_at_min_requests_and_ratio() {
        let cb = CircuitBreaker::new(config());
        let t = cb.allow().unwrap();
        cb.record(t, true);
        fail_n(&cb, 3);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.allow().unwrap_err();
        assert!(matches!(err, ExecutionError::CircuitOpen { .. }));
        assert!(err.retryable());
    }

    #[test]
    fn half_opens_after_timeout_and_closes_on_trial_successes() {
        let cb = CircuitBreaker::new(config());
        fail_n(&cb, 4);
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let p1 = cb.allow().unwrap();
        let p2 = cb.allow().unwrap();
        // Trial slots are bounded.
        assert!(cb.allow().is_err());

        cb.record(p1, true);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record(p2, true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn trial_failure_reopens() {
        let cb = CircuitBreaker::new(config());
        fail_n(&cb, 4);
        std::thread::sleep(Duration::from_millis(80));

        let trial = cb.allow().unwrap();
        cb.record(trial, false);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let cb = CircuitBreaker::new(config());
        let slow = cb.allow().unwrap();
        fail_n(&cb, 4);
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let before = cb.snapshot();
        // Admitted while closed; must not count as a trial.
        cb.record(slow, true);
        let after = cb.snapshot();
        assert_eq!(before.counts, after.counts);
        assert_eq!(after.state, CircuitState::HalfOpen);
    }

    #[test]
    fn closed_window_rolls_counts() {
        let cb = CircuitBreaker::new(BreakerConfig {
            interval: Duration::from_millis(30),
            ..config()
        });
        fail_n(&cb, 3);
        assert_eq!(cb.snapshot().counts.failures, 3);
        std::thread::sleep(Duration::from_millis(50));
        // Old failures were cleared, so one more does not reach min_requests.
        fail_n(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().counts.failures, 1);
    }

    #[test]
    fn unrecorded_trial_does_not_wedge_half_open() {
        let cb = CircuitBreaker::new(config());
        fail_n(&cb, 4);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Both trial slots taken, neither outcome ever recorded.
        let _lost1 = cb.allow().unwrap();
        let _lost2 = cb.allow().unwrap();
        assert!(cb.allow().is_err());

        // Half-open expires back to open, then half-opens with fresh slots.
        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let trial = cb.allow().unwrap();
        cb.record(trial, true);
        let trial = cb.allow().unwrap();
        cb.record(trial, true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn released_trial_frees_its_slot_without_counting() {
        let cb = CircuitBreaker::new(config());
        fail_n(&cb, 4);
        std::thread::sleep(Duration::from_millis(80));

        let p1 = cb.allow().unwrap();
        let p2 = cb.allow().unwrap();
        cb.release(p2);
        cb.record(p1, true);
        // One real success out of two required.
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().counts.successes, 1);

        let p3 = cb.allow().unwrap();
        cb.record(p3, true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn release_from_stale_generation_is_ignored() {
        let cb = CircuitBreaker::new(config());
        let old = cb.allow().unwrap();
        fail_n(&cb, 4);
        std::thread::sleep(Duration::from_millis(80));
        let trial = cb.allow().unwrap();
        cb.release(old);
        assert_eq!(cb.snapshot().counts.requests, 1);
        cb.record(trial, true);
    }

    #[test]
    fn snapshot_reports_retry_after_when_open() {
        let cb = CircuitBreaker::new(BreakerConfig {
            open_timeout: Duration::from_secs(10),
            ..config()
        });
        fail_n(&cb, 4);
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.retry_after_ms.is_some_and(|ms| ms > 9_000));
        assert_eq!(snap.transitions, 1);
    }
}
