//! Admission control: a concurrency semaphore plus the circuit breaker.
//!
//! The two gates are independent. A request first needs a breaker ticket,
//! then a semaphore permit. The resulting [`AdmissionSlot`] owns the permit
//! and releases it exactly once when dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::circuit_breaker::{BreakerConfig, BreakerSnapshot, BreakerTicket, CircuitBreaker};
use crate::error::ExecutionError;

#[derive(Debug, Default)]
struct SlotCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    rejected_concurrency: AtomicU64,
    rejected_breaker: AtomicU64,
}

/// Gatekeeper for execution slots.
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    wait: Duration,
    breaker: CircuitBreaker,
    counters: Arc<SlotCounters>,
}

/// A held concurrency permit.
///
/// Dropping the slot returns the permit. The breaker outcome is recorded
/// separately through [`AdmissionController::record`].
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
    ticket: BreakerTicket,
    acquired_at: Instant,
    counters: Arc<SlotCounters>,
}

impl AdmissionSlot {
    /// When the slot was granted.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Breaker ticket for this admission.
    pub fn ticket(&self) -> BreakerTicket {
        self.ticket
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time admission state.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    /// Configured permit count.
    pub max_concurrent: usize,
    /// Permits currently free.
    pub available: usize,
    /// Permits currently held.
    pub in_use: usize,
    /// Slots granted since start.
    pub acquired: u64,
    /// Slots returned since start.
    pub released: u64,
    /// Requests rejected by the semaphore.
    pub rejected_concurrency: u64,
    /// Requests rejected by the breaker.
    pub rejected_breaker: u64,
    /// Breaker state.
    pub breaker: BreakerSnapshot,
}

impl AdmissionController {
    /// Create a controller with `max_concurrent` permits.
    ///
    /// `wait` bounds how long [`acquire`](Self::acquire) waits for a permit;
    /// zero means try once.
    pub fn new(max_concurrent: usize, wait: Duration, breaker: BreakerConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            wait,
            breaker: CircuitBreaker::new(breaker),
            counters: Arc::new(SlotCounters::default()),
        }
    }

    /// Take a slot, or fail fast with `ConcurrencyLimit` / `CircuitOpen`.
    pub async fn acquire(&self) -> Result<AdmissionSlot, ExecutionError> {
        let ticket = match self.breaker.allow() {
            Ok(t) => t,
            Err(e) => {
                self.counters
                    .rejected_breaker
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let permit = if self.wait.is_zero() {
            self.semaphore.clone().try_acquire_owned().ok()
        } else {
            tokio::time::timeout(self.wait, self.semaphore.clone().acquire_owned())
                .await
                .ok()
                .and_then(Result::ok)
        };

        let Some(permit) = permit else {
            self.counters
                .rejected_concurrency
                .fetch_add(1, Ordering::Relaxed);
            // Never ran, so no outcome; only the breaker slot is returned.
            self.breaker.release(ticket);
            return Err(ExecutionError::ConcurrencyLimit {
                max: self.max_concurrent,
            });
        };

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(AdmissionSlot {
            _permit: permit,
            ticket,
            acquired_at: Instant::now(),
            counters: self.counters.clone(),
        })
    }

    /// Feed one execution outcome to the breaker.
    ///
    /// Takes the ticket rather than the slot so the outcome can be recorded
    /// after the slot has been dropped.
    pub fn record(&self, ticket: BreakerTicket, healthy: bool) {
        self.breaker.record(ticket, healthy);
    }

    /// The breaker, for inspection.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Stop granting slots. Requests already waiting fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Snapshot for health reporting.
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let available = self.semaphore.available_permits();
        AdmissionSnapshot {
            max_concurrent: self.max_concurrent,
            available,
            in_use: self.max_concurrent.saturating_sub(available),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            rejected_concurrency: self.counters.rejected_concurrency.load(Ordering::Relaxed),
            rejected_breaker: self.counters.rejected_breaker.load(Ordering::Relaxed),
            breaker: self.breaker.snapshot(),
        }
    }
}
