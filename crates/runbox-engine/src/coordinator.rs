//! The execution coordinator: the engine's public entry point.
//!
//! Each request moves through `Validating → Admitting → Dispatching →
//! Finalizing` and ends `Succeeded` or `Failed`. Every phase is logged with
//! the execution id. Whatever a request takes (admission slot, breaker
//! ticket, pooled runtime) is given back on every path, including panics
//! inside the dispatch task and callers that drop the future: each request
//! runs on its own task, and a dropped caller only cancels it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionController, AdmissionSnapshot};
use crate::analyzer::{CodeAnalyzer, Strategy};
use crate::audit::{sha256_hex, AuditEntry, AuditLogger, AuditOutcome, NoopAuditLogger, SecurityEvent};
use crate::cache::CacheStats;
use crate::circuit_breaker::BreakerConfig;
use crate::compile::{CompiledProgram, Compiler};
use crate::error::{ErrorKind, ExecutionError};
use crate::event_loop::{EventLoopExecutor, EventLoopStats};
use crate::pool::{PoolConfig, PoolHealth, RuntimePool};
use crate::request::{ExecutionContext, ExecutionResult};
use crate::runtime::RuntimeSettings;
use crate::stats::{ExecutorStats, StatsSnapshot};
use crate::validator::{SecurityValidator, DEFAULT_MAX_CODE_LENGTH};
use crate::{CapabilitySet, HostDispatcher};

/// Cache sizing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Compiled programs kept.
    pub compiled_capacity: usize,
    /// Validation verdicts kept.
    pub validation_capacity: usize,
    /// Shards per cache.
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compiled_capacity: 1_024,
            validation_capacity: 4_096,
            shards: 16,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard deadline for one execution.
    pub execution_timeout: Duration,
    /// Maximum code size in bytes.
    pub max_code_length: usize,
    /// Maximum serialized input size in bytes.
    pub max_input_size: usize,
    /// Maximum serialized result size in bytes.
    pub max_result_size: usize,
    /// V8 heap limit per runtime in bytes.
    pub max_heap_size: usize,
    /// Admission slots.
    pub max_concurrent: usize,
    /// How long admission waits for a slot; zero means try once.
    pub concurrency_wait: Duration,
    /// Host capability calls allowed per execution.
    pub max_host_calls: usize,
    /// Maximum serialized arguments per host call in bytes.
    pub max_host_call_args_size: usize,
    /// Globals removed on top of the built-in list.
    pub disabled_globals: Vec<String>,
    /// Runtime pool sizing.
    pub pool: PoolConfig,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
    /// Cache sizing.
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(5),
            max_code_length: DEFAULT_MAX_CODE_LENGTH,
            max_input_size: 1024 * 1024,
            max_result_size: 1024 * 1024,
            max_heap_size: 64 * 1024 * 1024,
            max_concurrent: 64,
            concurrency_wait: Duration::ZERO,
            max_host_calls: 64,
            max_host_call_args_size: 256 * 1024,
            disabled_globals: Vec::new(),
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        let invalid = |reason: &str| {
            Err(ExecutionError::ValidationFailed {
                reason: reason.to_string(),
            })
        };
        if self.execution_timeout.is_zero() {
            return invalid("execution_timeout must be greater than zero");
        }
        if self.pool.max_size == 0 {
            return invalid("pool.max_size must be at least 1");
        }
        if self.pool.min_size > self.pool.max_size {
            return invalid("pool.min_size must not exceed pool.max_size");
        }
        if !(self.breaker.failure_ratio > 0.0 && self.breaker.failure_ratio <= 1.0) {
            return invalid("breaker.failure_ratio must be in (0, 1]");
        }
        if self.breaker.half_open_max_requests == 0 {
            return invalid("breaker.half_open_max_requests must be at least 1");
        }
        Ok(())
    }
}

/// Everything observable about the engine, in one serializable report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Execution counters.
    pub stats: StatsSnapshot,
    /// Compiled-program cache.
    pub compiled_cache: CacheStats,
    /// Validation cache.
    pub validation_cache: CacheStats,
    /// Runtime pool.
    pub pool: PoolHealth,
    /// Event-loop path.
    pub event_loop: EventLoopStats,
    /// Admission and breaker.
    pub admission: AdmissionSnapshot,
}

struct EngineInner {
    config: EngineConfig,
    compiler: Compiler,
    admission: AdmissionController,
    pool: Arc<RuntimePool>,
    event_loop: EventLoopExecutor,
    stats: ExecutorStats,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: std::sync::OnceLock<Arc<crate::metrics::RunboxMetrics>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// Where a request ended up, for stats and audit.
struct Outcome {
    path: Option<Strategy>,
    result: Result<Finished, ExecutionError>,
}

/// A successful execution before it is reported.
struct Finished {
    value: serde_json::Value,
    size: usize,
    path: Strategy,
}

/// The execution engine.
///
/// Cheap to clone; clones share pools, caches and counters. Must be created
/// inside a tokio runtime, which hosts the pool reconciler.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine, warm the pool and start its reconciler.
    pub async fn new(
        config: EngineConfig,
        capabilities: CapabilitySet,
        dispatcher: Option<Arc<dyn HostDispatcher>>,
    ) -> Result<Self, ExecutionError> {
        Self::with_audit_logger(config, capabilities, dispatcher, Arc::new(NoopAuditLogger)).await
    }

    /// Create an engine with an audit logger.
    pub async fn with_audit_logger(
        config: EngineConfig,
        capabilities: CapabilitySet,
        dispatcher: Option<Arc<dyn HostDispatcher>>,
        audit_logger: Arc<dyn AuditLogger>,
    ) -> Result<Self, ExecutionError> {
        config.validate()?;

        let settings = Arc::new(RuntimeSettings::new(
            &capabilities,
            &config.disabled_globals,
            config.max_heap_size,
            dispatcher,
            config.max_host_calls,
            config.max_host_call_args_size,
        )?);

        let compiler = Compiler::new(
            SecurityValidator::new(config.max_code_length),
            CodeAnalyzer::new(&capabilities),
            config.cache.compiled_capacity,
            config.cache.validation_capacity,
            config.cache.shards,
        );
        let admission = AdmissionController::new(
            config.max_concurrent,
            config.concurrency_wait,
            config.breaker.clone(),
        );

        let pool = Arc::new(RuntimePool::new(config.pool.clone(), settings.clone()));
        let warmed = pool.warm().await;
        pool.start_reconciler();

        tracing::info!(
            pool_warm = warmed,
            pool_max = config.pool.max_size,
            max_concurrent = config.max_concurrent,
            capabilities = capabilities.len(),
            "engine started"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                event_loop: EventLoopExecutor::new(settings),
                config,
                compiler,
                admission,
                pool,
                stats: ExecutorStats::default(),
                audit_logger,
                #[cfg(feature = "metrics")]
                metrics: std::sync::OnceLock::new(),
            }),
        })
    }

    /// Attach Prometheus metrics. Only the first call takes effect.
    #[cfg(feature = "metrics")]
    pub fn attach_metrics(&self, metrics: Arc<crate::metrics::RunboxMetrics>) -> bool {
        self.inner.metrics.set(metrics).is_ok()
    }

    /// Execute `code` with `input` bound to the `input` parameter.
    pub async fn execute(
        &self,
        ctx: ExecutionContext,
        code: &str,
        input: serde_json::Value,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.submit(ctx, Ok(code.to_string()), input).await
    }

    /// Execute base64-encoded `code`.
    ///
    /// The encoded size is checked before decoding.
    pub async fn execute_encoded(
        &self,
        ctx: ExecutionContext,
        encoded: &str,
        input: serde_json::Value,
    ) -> Result<ExecutionResult, ExecutionError> {
        let code = self.inner.compiler.validator().decode(encoded);
        self.submit(ctx, code, input).await
    }

    /// Run the request on its own task. Dropping the returned future cancels
    /// the request; the task still finishes its bookkeeping.
    async fn submit(
        &self,
        ctx: ExecutionContext,
        code: Result<String, ExecutionError>,
        input: serde_json::Value,
    ) -> Result<ExecutionResult, ExecutionError> {
        let cancel = ctx.cancellation.child_token();
        let _stop_on_drop = cancel.clone().drop_guard();
        let ctx = ctx.with_cancellation(cancel);
        let inner = Arc::clone(&self.inner);
        match tokio::spawn(inner.run(ctx, code, input)).await {
            Ok(result) => result,
            Err(join) => {
                tracing::error!(error = %join, "request task failed");
                Err(ExecutionError::internal("request task failed"))
            }
        }
    }

    /// Execution counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Compiled-program cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.compiler.cache_stats()
    }

    /// Validation cache counters.
    pub fn validation_cache_stats(&self) -> CacheStats {
        self.inner.compiler.validation_cache_stats()
    }

    /// Runtime pool health.
    pub fn pool_health(&self) -> PoolHealth {
        self.inner.pool.health()
    }

    /// Admission and breaker state.
    pub fn admission(&self) -> AdmissionSnapshot {
        self.inner.admission.snapshot()
    }

    /// Everything above in one report.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            stats: self.stats(),
            compiled_cache: self.cache_stats(),
            validation_cache: self.validation_cache_stats(),
            pool: self.pool_health(),
            event_loop: self.inner.event_loop.stats(),
            admission: self.admission(),
        }
    }

    /// Stop admitting requests and drain the pool.
    pub fn shutdown(&self) {
        self.inner.admission.close();
        self.inner.pool.shutdown();
        tracing::info!("engine shut down");
    }
}

impl EngineInner {
    async fn run(
        self: Arc<Self>,
        ctx: ExecutionContext,
        code: Result<String, ExecutionError>,
        input: serde_json::Value,
    ) -> Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();
        let timestamp = Utc::now();
        self.stats.begin();

        let (code_hash, outcome) = match &code {
            Ok(code) => {
                tracing::info!(
                    execution_id = %ctx.execution_id,
                    code_len = code.len(),
                    "execute: starting"
                );
                (sha256_hex(code), self.process(&ctx, code, input).await)
            }
            Err(e) => (
                String::new(),
                Outcome {
                    path: None,
                    result: Err(e.clone()),
                },
            ),
        };

        let elapsed = start.elapsed();
        let Outcome { path, result } = outcome;
        self.stats
            .finish(elapsed, result.as_ref().err().map(ExecutionError::kind));
        self.observe(path, elapsed, &result);

        match &result {
            Ok(finished) => tracing::info!(
                execution_id = %ctx.execution_id,
                phase = "succeeded",
                path = finished.path.as_str(),
                duration_ms = elapsed.as_millis() as u64,
                "execute: complete"
            ),
            Err(e) => tracing::warn!(
                execution_id = %ctx.execution_id,
                phase = "failed",
                kind = e.kind().as_str(),
                error = %e,
                "execute: failed"
            ),
        }

        let sized = result.as_ref().map(|f| f.size).map_err(Clone::clone);
        let entry = AuditEntry {
            execution_id: ctx.execution_id.clone(),
            timestamp,
            code_hash,
            path,
            duration_ms: elapsed.as_millis() as u64,
            result_size_bytes: sized.as_ref().copied().unwrap_or(0),
            outcome: AuditOutcome::of(&sized),
        };
        self.audit_logger.log(&entry).await;

        let Finished { value, path, .. } = result?;
        Ok(ExecutionResult {
            value,
            execution_id: ctx.execution_id,
            path,
            duration: elapsed,
        })
    }

    async fn process(
        self: &Arc<Self>,
        ctx: &ExecutionContext,
        code: &str,
        input: serde_json::Value,
    ) -> Outcome {
        let id = ctx.execution_id.as_str();

        tracing::debug!(execution_id = %id, phase = "validating", "execute: validating");
        let prepared = self
            .envelope(id, &input)
            .and_then(|envelope| Ok((envelope, self.compile(id, code)?)));
        let (envelope, program) = match prepared {
            Ok(p) => p,
            Err(e) => {
                if e.kind() == ErrorKind::Security {
                    self.audit_logger
                        .log_security(&SecurityEvent::new(id, code, &e))
                        .await;
                }
                return Outcome {
                    path: None,
                    result: Err(e),
                };
            }
        };
        let path = program.strategy();

        tracing::debug!(execution_id = %id, phase = "admitting", path = path.as_str(), "execute: admitting");
        let slot = match self.admission.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                return Outcome {
                    path: Some(path),
                    result: Err(e),
                }
            }
        };
        let ticket = slot.ticket();

        let timeout = ctx.remaining(self.config.execution_timeout);
        let cancel = ctx.cancellation.child_token();

        tracing::debug!(
            execution_id = %id,
            phase = "dispatching",
            path = path.as_str(),
            timeout_ms = timeout.as_millis() as u64,
            "execute: dispatching"
        );
        self.stats.dispatched(path);

        let result = if timeout.is_zero() {
            drop(slot);
            Err(ExecutionError::Timeout { timeout_ms: 0 })
        } else {
            let engine = Arc::clone(self);
            let task_cancel = cancel.clone();
            let task = tokio::spawn(async move {
                let _slot = slot;
                engine.dispatch(program, envelope, timeout, &task_cancel).await
            });
            match task.await {
                Ok(result) => result,
                Err(join) => {
                    cancel.cancel();
                    tracing::error!(execution_id = %id, error = %join, "execution task failed");
                    Err(ExecutionError::internal(if join.is_panic() {
                        "execution task panicked"
                    } else {
                        "execution task aborted"
                    }))
                }
            }
        };

        tracing::debug!(execution_id = %id, phase = "finalizing", "execute: finalizing");
        let result = result
            .and_then(|json| self.finalize(json))
            .map(|(value, size)| Finished { value, size, path });
        self.admission
            .record(ticket, !matches!(&result, Err(e) if e.is_engine_failure()));

        Outcome {
            path: Some(path),
            result,
        }
    }

    /// Serialize `{input, executionId}`, enforcing the input size limit.
    fn envelope(&self, id: &str, input: &serde_json::Value) -> Result<String, ExecutionError> {
        let input_json = serde_json::to_string(input).map_err(|e| ExecutionError::ValidationFailed {
            reason: format!("input is not serializable: {e}"),
        })?;
        if input_json.len() > self.config.max_input_size {
            return Err(ExecutionError::InputTooLarge {
                max: self.config.max_input_size,
                actual: input_json.len(),
            });
        }
        let id_json = serde_json::to_string(id).map_err(|e| ExecutionError::internal(e.to_string()))?;
        Ok(format!(r#"{{"input":{input_json},"executionId":{id_json}}}"#))
    }

    fn compile(&self, id: &str, code: &str) -> Result<Arc<CompiledProgram>, ExecutionError> {
        self.compiler.validate(code)?;
        let program = self.compiler.compile(code)?;
        tracing::debug!(
            execution_id = %id,
            code_hash = %program.code_hash,
            strategy = program.strategy().as_str(),
            reason = program.features.reason.unwrap_or("none"),
            "execute: classified"
        );
        Ok(program)
    }

    async fn dispatch(
        &self,
        program: Arc<CompiledProgram>,
        envelope: String,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError> {
        match program.strategy() {
            Strategy::Pool => {
                let started = Instant::now();
                let acquire_timeout = self.config.pool.acquire_timeout.min(timeout);
                let mut lease = self.pool.acquire(acquire_timeout).await?;
                let remaining = timeout.saturating_sub(started.elapsed());
                let result = lease.execute(program, envelope, remaining, cancel).await;
                lease.release();
                result
            }
            Strategy::EventLoop => {
                self.event_loop
                    .execute(program, envelope, timeout, cancel)
                    .await
            }
        }
    }

    /// Enforce the result size limit and parse the result JSON.
    fn finalize(&self, json: String) -> Result<(serde_json::Value, usize), ExecutionError> {
        let size = json.len();
        if size > self.config.max_result_size {
            return Err(ExecutionError::OutputTooLarge {
                max: self.config.max_result_size,
                actual: size,
            });
        }
        let value = serde_json::from_str(&json).map_err(|e| ExecutionError::ResultNotSerializable {
            reason: e.to_string(),
        })?;
        Ok((value, size))
    }

    #[cfg(feature = "metrics")]
    fn observe(
        &self,
        path: Option<Strategy>,
        elapsed: Duration,
        result: &Result<Finished, ExecutionError>,
    ) {
        let Some(metrics) = self.metrics.get() else {
            return;
        };
        if let Some(path) = path {
            metrics.record_execution(path.as_str(), elapsed.as_secs_f64());
        }
        if let Err(e) = result {
            metrics.record_error(e.kind().as_str());
        }
        metrics.set_pool_runtimes(self.pool.size());
    }

    #[cfg(not(feature = "metrics"))]
    fn observe(
        &self,
        _path: Option<Strategy>,
        _elapsed: Duration,
        _result: &Result<Finished, ExecutionError>,
    ) {
    }
}
