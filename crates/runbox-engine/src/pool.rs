//! Pool of warm runtimes for the synchronous fast path.
//!
//! Creating a V8 runtime and installing the bootstrap costs several
//! milliseconds, so synchronous executions borrow a sealed runtime instead.
//! Reuse is only safe while the runtime's global state is untouched: after
//! every job the runtime verifies itself against the baseline captured at
//! bootstrap, and a runtime that fails, times out or hits its heap limit is
//! destroyed and replaced. There is no reset.
//!
//! Sizing is elastic but driven only by a background reconciler: it grows
//! the pool when acquires had to wait, replenishes it below `min_size` and
//! evicts runtimes idle longer than `idle_timeout` while above `min_size`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::compile::CompiledProgram;
use crate::error::ExecutionError;
use crate::runtime::{JobReply, PooledRuntime, RuntimeSettings};

/// Acquire-wait samples kept for percentile reporting.
const WAIT_SAMPLE_WINDOW: usize = 1024;

/// Configuration for the runtime pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Runtimes kept alive even when idle.
    pub min_size: usize,
    /// Upper bound on live runtimes.
    pub max_size: usize,
    /// Idle runtimes above `min_size` are evicted after this long.
    pub idle_timeout: Duration,
    /// How long `acquire` waits for a free runtime.
    pub acquire_timeout: Duration,
    /// Retire a runtime after this many executions.
    pub max_uses: Option<u32>,
    /// Reconciler tick when nothing wakes it earlier.
    pub reconcile_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 8,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(2),
            max_uses: Some(1_000),
            reconcile_interval: Duration::from_secs(1),
        }
    }
}

/// Atomic counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Runtimes created.
    pub created: AtomicU64,
    /// Acquires served by an existing runtime.
    pub reused: AtomicU64,
    /// Runtimes discarded because the integrity check failed.
    pub discarded_dirty: AtomicU64,
    /// Runtimes discarded after a timeout, cancellation, heap limit or crash.
    pub discarded_fatal: AtomicU64,
    /// Runtimes retired after `max_uses` executions.
    pub retired_max_uses: AtomicU64,
    /// Runtimes evicted for idleness.
    pub evicted_idle: AtomicU64,
    /// Runtime creations that failed.
    pub spawn_failures: AtomicU64,
}

/// How a leased runtime came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReleaseOutcome {
    /// Integrity check passed; the runtime can be reused.
    Ok,
    /// Global state may have changed; discard and replace.
    Dirty,
    /// Timed out, cancelled, out of heap or crashed; discard and replace.
    Fatal,
}

/// Pool health for observability.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    /// Live runtimes (idle + leased + starting).
    pub size: usize,
    /// Runtimes waiting in the idle list.
    pub idle: usize,
    /// Runtimes currently leased.
    pub in_use: usize,
    /// Highest `in_use` observed.
    pub peak_in_use: usize,
    /// Acquires currently waiting.
    pub waiters: usize,
    /// Configured minimum.
    pub min_size: usize,
    /// Configured maximum.
    pub max_size: usize,
    /// Runtimes created.
    pub created: u64,
    /// Acquires served by an existing runtime.
    pub reused: u64,
    /// Runtimes discarded after a failed integrity check.
    pub discarded_dirty: u64,
    /// Runtimes discarded after a fatal outcome.
    pub discarded_fatal: u64,
    /// Runtimes retired after `max_uses`.
    pub retired_max_uses: u64,
    /// Runtimes evicted for idleness.
    pub evicted_idle: u64,
    /// Median acquire wait in milliseconds.
    pub wait_p50_ms: f64,
    /// 95th percentile acquire wait in milliseconds.
    pub wait_p95_ms: f64,
    /// 99th percentile acquire wait in milliseconds.
    pub wait_p99_ms: f64,
}

/// A pool of warm, sealed runtimes.
pub struct RuntimePool {
    config: PoolConfig,
    settings: Arc<RuntimeSettings>,
    idle: Mutex<VecDeque<PooledRuntime>>,
    /// Live runtimes, counting ones still starting.
    size: AtomicUsize,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    waiters: AtomicUsize,
    /// Set when an acquire had to wait since the last reconcile.
    contended: AtomicBool,
    /// Discarded runtimes not yet replaced.
    replace_pending: AtomicUsize,
    next_id: AtomicU64,
    available: Notify,
    wake: Notify,
    shutting_down: AtomicBool,
    metrics: PoolMetrics,
    waits: Mutex<VecDeque<Duration>>,
}

/// A runtime checked out of the pool.
///
/// The pool holds no reference to a leased runtime. Dropping the lease
/// returns it with the outcome of the last execution; a lease dropped
/// mid-execution counts as fatal.
pub struct RuntimeLease {
    runtime: Option<PooledRuntime>,
    pool: Arc<RuntimePool>,
    outcome: ReleaseOutcome,
}

impl std::fmt::Debug for RuntimeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeLease")
            .field("runtime", &self.runtime)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl RuntimeLease {
    /// Run `program` on the leased runtime.
    ///
    /// On timeout or cancellation the runtime is interrupted and the lease
    /// is marked fatal; the caller gets an error without waiting for the
    /// worker thread to unwind.
    pub async fn execute(
        &mut self,
        program: Arc<CompiledProgram>,
        envelope: String,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError> {
        let runtime = self
            .runtime
            .as_mut()
            .ok_or_else(|| ExecutionError::internal("lease already released"))?;
        runtime.uses += 1;
        self.outcome = ReleaseOutcome::Fatal;

        let job_cancel = cancel.child_token();
        let reply = runtime.submit(program, envelope, job_cancel.clone())?;

        tokio::select! {
            reply = reply => match reply {
                Ok(JobReply { result, clean }) => {
                    self.outcome = match (&result, clean) {
                        (_, true) => ReleaseOutcome::Ok,
                        (Ok(_), false) | (Err(ExecutionError::JsError { .. }), false) => {
                            ReleaseOutcome::Dirty
                        }
                        _ => ReleaseOutcome::Fatal,
                    };
                    result
                }
                Err(_) => Err(ExecutionError::internal("sandbox thread panicked")),
            },
            _ = tokio::time::sleep(timeout) => {
                job_cancel.cancel();
                runtime.terminate();
                Err(ExecutionError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => {
                runtime.terminate();
                Err(ExecutionError::Cancelled)
            }
        }
    }

    /// Outcome the runtime will be returned with.
    pub fn outcome(&self) -> ReleaseOutcome {
        self.outcome
    }

    /// Return the runtime to the pool now.
    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.pool.give_back(runtime, self.outcome);
        }
    }
}

impl Drop for RuntimeLease {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Decrements the waiter count however the acquire ends.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl RuntimePool {
    /// Create an empty pool. Call [`warm`](Self::warm) and
    /// [`start_reconciler`](Self::start_reconciler) to bring it up.
    pub fn new(config: PoolConfig, settings: Arc<RuntimeSettings>) -> Self {
        Self {
            config,
            settings,
            idle: Mutex::new(VecDeque::new()),
            size: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            peak_in_use: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            contended: AtomicBool::new(false),
            replace_pending: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            available: Notify::new(),
            wake: Notify::new(),
            shutting_down: AtomicBool::new(false),
            metrics: PoolMetrics::default(),
            waits: Mutex::new(VecDeque::with_capacity(WAIT_SAMPLE_WINDOW)),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pool counters.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Live runtimes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Borrow a runtime, waiting up to `timeout` for one to become free.
    ///
    /// Never creates runtimes itself: a wait flags contention so the
    /// reconciler grows the pool.
    #[tracing::instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<RuntimeLease, ExecutionError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut waiting: Option<WaiterGuard<'_>> = None;

        loop {
            if self.is_shutting_down() {
                return Err(ExecutionError::internal("runtime pool is shutting down"));
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.idle.lock().pop_front();
            if let Some(runtime) = next {
                self.record_wait(start.elapsed());
                if runtime.uses() > 0 {
                    self.metrics.reused.fetch_add(1, Ordering::Relaxed);
                }
                let in_use = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
                self.peak_in_use.fetch_max(in_use, Ordering::AcqRel);
                tracing::debug!(runtime_id = runtime.id(), "runtime acquired");
                return Ok(RuntimeLease {
                    runtime: Some(runtime),
                    pool: Arc::clone(self),
                    outcome: ReleaseOutcome::Ok,
                });
            }

            if waiting.is_none() {
                self.waiters.fetch_add(1, Ordering::Relaxed);
                waiting = Some(WaiterGuard(&self.waiters));
                self.contended.store(true, Ordering::Release);
                self.wake.notify_one();
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let waited = start.elapsed();
                self.record_wait(waited);
                tracing::warn!(
                    waited_ms = waited.as_millis() as u64,
                    size = self.size(),
                    "runtime pool exhausted"
                );
                return Err(ExecutionError::ResourceExhausted {
                    waited_ms: waited.as_millis() as u64,
                });
            }
        }
    }

    /// Return a runtime according to `outcome`.
    fn give_back(&self, mut runtime: PooledRuntime, outcome: ReleaseOutcome) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);

        let retire = match outcome {
            ReleaseOutcome::Fatal => {
                runtime.terminate();
                self.metrics.discarded_fatal.fetch_add(1, Ordering::Relaxed);
                true
            }
            ReleaseOutcome::Dirty => {
                self.metrics.discarded_dirty.fetch_add(1, Ordering::Relaxed);
                true
            }
            ReleaseOutcome::Ok => {
                let worn_out = self.config.max_uses.is_some_and(|max| runtime.uses() >= max);
                if worn_out {
                    self.metrics.retired_max_uses.fetch_add(1, Ordering::Relaxed);
                }
                worn_out
            }
        };

        if retire || self.is_shutting_down() {
            tracing::debug!(
                runtime_id = runtime.id(),
                outcome = ?outcome,
                uses = runtime.uses(),
                "runtime discarded"
            );
            drop(runtime);
            self.size.fetch_sub(1, Ordering::AcqRel);
            if !self.is_shutting_down() {
                self.replace_pending.fetch_add(1, Ordering::AcqRel);
                self.wake.notify_one();
            }
            return;
        }

        runtime.idle_since = Instant::now();
        self.idle.lock().push_back(runtime);
        self.available.notify_one();
    }

    /// Create runtimes until the pool holds `min_size`. Returns how many
    /// were created; failures are logged and skipped.
    pub async fn warm(&self) -> usize {
        let missing = self.config.min_size.saturating_sub(self.size());
        self.grow(missing).await
    }

    /// Create up to `n` runtimes without exceeding `max_size`.
    async fn grow(&self, n: usize) -> usize {
        let mut created = 0;
        for _ in 0..n {
            if self.is_shutting_down() || !self.reserve_slot() {
                break;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match PooledRuntime::spawn(id, self.settings.clone()).await {
                Ok(runtime) => {
                    self.metrics.created.fetch_add(1, Ordering::Relaxed);
                    created += 1;
                    if self.is_shutting_down() {
                        self.size.fetch_sub(1, Ordering::AcqRel);
                        break;
                    }
                    self.idle.lock().push_back(runtime);
                    self.available.notify_one();
                }
                Err(e) => {
                    self.size.fetch_sub(1, Ordering::AcqRel);
                    self.metrics.spawn_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "failed to create runtime");
                    break;
                }
            }
        }
        created
    }

    /// Count a runtime about to be created, if there is room.
    fn reserve_slot(&self) -> bool {
        self.size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                (size < self.config.max_size).then_some(size + 1)
            })
            .is_ok()
    }

    /// Drop runtimes idle longer than `idle_timeout`, keeping `min_size`.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut idle = self.idle.lock();
            let mut kept = VecDeque::with_capacity(idle.len());
            while let Some(runtime) = idle.pop_front() {
                let remaining = self.size().saturating_sub(evicted.len());
                let expired = now.duration_since(runtime.idle_since) > self.config.idle_timeout;
                if expired && remaining > self.config.min_size {
                    evicted.push(runtime);
                } else {
                    kept.push_back(runtime);
                }
            }
            *idle = kept;
        }

        let count = evicted.len();
        if count > 0 {
            self.size.fetch_sub(count, Ordering::AcqRel);
            self.metrics
                .evicted_idle
                .fetch_add(count as u64, Ordering::Relaxed);
            tracing::debug!(evicted = count, "evicted idle runtimes");
        }
        count
    }

    /// One reconciler pass: evict, replace discards, replenish, grow.
    pub async fn reconcile(&self) {
        self.evict_idle();

        let size = self.size();
        let replace = self.replace_pending.swap(0, Ordering::AcqRel);
        let mut target = size.max(self.config.min_size).max(size + replace);
        if self.contended.swap(false, Ordering::AcqRel) {
            let waiters = self.waiters.load(Ordering::Relaxed).max(1);
            target = target.max(size + waiters);
        }
        let target = target.min(self.config.max_size);

        if target > size {
            let created = self.grow(target - size).await;
            tracing::debug!(size, target, created, "runtime pool reconciled");
        }
    }

    /// Start the background reconciler.
    ///
    /// The task ends once the pool shuts down.
    pub fn start_reconciler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = self.config.reconcile_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if pool.is_shutting_down() {
                    break;
                }
                pool.reconcile().await;
            }
        })
    }

    /// Stop the reconciler, reject new acquires and drop idle runtimes.
    ///
    /// Leased runtimes are dropped as their leases come back.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<PooledRuntime> = self.idle.lock().drain(..).collect();
        self.size.fetch_sub(drained.len(), Ordering::AcqRel);
        drop(drained);
        self.wake.notify_one();
        self.available.notify_waiters();
        tracing::info!("runtime pool shut down");
    }

    fn record_wait(&self, waited: Duration) {
        let mut waits = self.waits.lock();
        if waits.len() == WAIT_SAMPLE_WINDOW {
            waits.pop_front();
        }
        waits.push_back(waited);
    }

    /// Current pool health.
    pub fn health(&self) -> PoolHealth {
        let mut samples: Vec<Duration> = self.waits.lock().iter().copied().collect();
        samples.sort_unstable();
        let idle = self.idle.lock().len();
        let m = &self.metrics;
        PoolHealth {
            size: self.size(),
            idle,
            in_use: self.in_use.load(Ordering::Acquire),
            peak_in_use: self.peak_in_use.load(Ordering::Acquire),
            waiters: self.waiters.load(Ordering::Relaxed),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            created: m.created.load(Ordering::Relaxed),
            reused: m.reused.load(Ordering::Relaxed),
            discarded_dirty: m.discarded_dirty.load(Ordering::Relaxed),
            discarded_fatal: m.discarded_fatal.load(Ordering::Relaxed),
            retired_max_uses: m.retired_max_uses.load(Ordering::Relaxed),
            evicted_idle: m.evicted_idle.load(Ordering::Relaxed),
            wait_p50_ms: percentile_ms(&samples, 0.50),
            wait_p95_ms: percentile_ms(&samples, 0.95),
            wait_p99_ms: percentile_ms(&samples, 0.99),
        }
    }
}

/// Nearest-rank percentile of sorted samples, in milliseconds.
fn percentile_ms(sorted: &[Duration], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index].as_secs_f64() * 1_000.0
}
