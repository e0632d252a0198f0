//! Asynchronous execution path: one fresh runtime and event loop per call.
//!
//! Code that awaits, schedules timers or calls host capabilities needs an
//! event loop that outlives `execute_script`. Each invocation gets its own
//! OS thread, current-thread tokio runtime and [`SandboxRuntime`]; nothing
//! is shared between invocations, so there is nothing to verify or reset.
//!
//! On deadline or cancellation the caller signals the worker (cancellation
//! token plus `terminate_execution`) and returns immediately. The worker
//! unwinds in the background and its late result is dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::v8;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::compile::CompiledProgram;
use crate::error::ExecutionError;
use crate::runtime::{RuntimeSettings, SandboxRuntime};

/// Event-loop path counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EventLoopStats {
    /// Invocations currently running.
    pub active: usize,
    /// Invocations started.
    pub started: u64,
    /// Invocations stopped by deadline or cancellation.
    pub interrupted: u64,
}

/// Runs each asynchronous program on a dedicated thread.
pub struct EventLoopExecutor {
    settings: Arc<RuntimeSettings>,
    active: Arc<AtomicUsize>,
    started: AtomicU64,
    interrupted: AtomicU64,
}

/// Decrements the active count when the worker thread finishes.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl EventLoopExecutor {
    /// Create an executor building runtimes from `settings`.
    pub fn new(settings: Arc<RuntimeSettings>) -> Self {
        Self {
            settings,
            active: Arc::new(AtomicUsize::new(0)),
            started: AtomicU64::new(0),
            interrupted: AtomicU64::new(0),
        }
    }

    /// Run `program` to settlement, giving up after `timeout` or when
    /// `cancel` fires.
    pub async fn execute(
        &self,
        program: Arc<CompiledProgram>,
        envelope: String,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError> {
        let job_cancel = cancel.child_token();
        let worker_cancel = job_cancel.clone();
        let settings = self.settings.clone();
        let (handle_tx, mut handle_rx) = oneshot::channel::<v8::IsolateHandle>();
        let (tx, rx) = oneshot::channel();

        self.active.fetch_add(1, Ordering::AcqRel);
        self.started.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard(self.active.clone());

        let spawned = std::thread::Builder::new()
            .name("runbox-event-loop".into())
            .spawn(move || {
                let _guard = guard;
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if tx.send(Err(ExecutionError::internal(e.to_string()))).is_err() {
                            tracing::warn!("sandbox result receiver dropped");
                        }
                        return;
                    }
                };
                let result = rt.block_on(async move {
                    let mut sandbox = SandboxRuntime::new(settings).await?;
                    // The caller may already be gone; it then never terminates us.
                    let _ = handle_tx.send(sandbox.isolate_handle());
                    if worker_cancel.is_cancelled() {
                        return Err(ExecutionError::Cancelled);
                    }
                    let result = sandbox.run(&program, envelope, &worker_cancel).await;
                    if sandbox.heap_exceeded() && result.is_err() {
                        return Err(ExecutionError::HeapLimitExceeded);
                    }
                    result
                });
                if tx.send(result).is_err() {
                    tracing::debug!("sandbox result receiver dropped before result was sent");
                }
            });
        if let Err(e) = spawned {
            return Err(ExecutionError::internal(format!(
                "failed to spawn event loop thread: {e}"
            )));
        }

        let mut stop = |reason: &str| {
            job_cancel.cancel();
            if let Ok(handle) = handle_rx.try_recv() {
                handle.terminate_execution();
            }
            self.interrupted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(reason, "event loop execution interrupted");
        };

        tokio::select! {
            result = rx => result.map_err(|_| ExecutionError::internal("sandbox thread panicked"))?,
            _ = tokio::time::sleep(timeout) => {
                stop("timeout");
                Err(ExecutionError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => {
                stop("cancelled");
                Err(ExecutionError::Cancelled)
            }
        }
    }

    /// Invocations whose worker thread is still running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EventLoopStats {
        EventLoopStats {
            active: self.active(),
            started: self.started.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}
