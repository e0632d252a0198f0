//! End-to-end tests through `Engine::execute` on real V8 runtimes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use runbox_engine::audit::{AuditEntry, AuditLogger, SecurityEvent};
use runbox_engine::circuit_breaker::{BreakerConfig, CircuitState};
use runbox_engine::pool::PoolConfig;
use runbox_engine::{
    Capability, CapabilitySet, DispatchError, Engine, EngineConfig, ErrorKind, ExecutionContext,
    ExecutionError, HostDispatcher, Strategy,
};
use serde_json::{json, Value};
use serial_test::serial;

struct EchoDispatcher {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl HostDispatcher for EchoDispatcher {
    async fn call(&self, capability: &str, method: &str, args: Value) -> Result<Value, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (capability, method) {
            ("echo", "call") => Ok(args.get(0).cloned().unwrap_or(Value::Null)),
            ("crypto", "randomUUID") => Ok(json!("00000000-0000-4000-8000-000000000000")),
            _ => Err(DispatchError::MethodNotFound {
                capability: capability.into(),
                method: method.into(),
            }),
        }
    }
}

#[derive(Default)]
struct RecordingAudit {
    entries: AtomicUsize,
    security: AtomicUsize,
}

#[async_trait::async_trait]
impl AuditLogger for RecordingAudit {
    async fn log(&self, _entry: &AuditEntry) {
        self.entries.fetch_add(1, Ordering::SeqCst);
    }

    async fn log_security(&self, _event: &SecurityEvent) {
        self.security.fetch_add(1, Ordering::SeqCst);
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        execution_timeout: Duration::from_secs(2),
        pool: PoolConfig {
            min_size: 1,
            max_size: 2,
            acquire_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn capabilities() -> CapabilitySet {
    CapabilitySet::new(vec![
        Capability::function("echo"),
        Capability::namespace("crypto", ["randomUUID"]),
    ])
}

async fn engine_with(config: EngineConfig) -> (Engine, Arc<EchoDispatcher>) {
    let dispatcher = Arc::new(EchoDispatcher {
        calls: AtomicUsize::new(0),
    });
    let engine = Engine::new(config, capabilities(), Some(dispatcher.clone()))
        .await
        .unwrap();
    (engine, dispatcher)
}

async fn engine() -> Engine {
    engine_with(config()).await.0
}

#[tokio::test]
#[serial]
async fn sync_sum_runs_on_pool() {
    let engine = engine().await;
    let result = engine
        .execute(
            ExecutionContext::new(),
            "return input.a + input.b;",
            json!({"a": 10, "b": 20}),
        )
        .await
        .unwrap();
    assert_eq!(result.value, json!(30));
    assert_eq!(result.path, Strategy::Pool);
}

#[tokio::test]
#[serial]
async fn timer_promise_runs_on_event_loop() {
    let engine = engine().await;
    let start = Instant::now();
    let result = engine
        .execute(
            ExecutionContext::new(),
            "return await new Promise(resolve => setTimeout(() => resolve(1), 50));",
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(result.value, json!(1));
    assert_eq!(result.path, Strategy::EventLoop);
    assert!(start.elapsed() >= Duration::from_millis(45));
}

#[tokio::test]
#[serial]
async fn infinite_loop_is_rejected_and_audited() {
    let audit = Arc::new(RecordingAudit::default());
    let engine = Engine::with_audit_logger(config(), capabilities(), None, audit.clone())
        .await
        .unwrap();
    let err = engine
        .execute(ExecutionContext::new(), "while(true){}", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);
    assert_eq!(audit.security.load(Ordering::SeqCst), 1);
    assert_eq!(audit.entries.load(Ordering::SeqCst), 1);
    assert_eq!(engine.pool_health().created, 1);
    assert_eq!(engine.admission().acquired, 0);
}

#[tokio::test]
#[serial]
async fn oversized_code_is_a_validation_error() {
    let engine = engine_with(EngineConfig {
        max_code_length: 1024,
        ..config()
    })
    .await
    .0;
    let code = format!("return '{}';", "x".repeat(2048));
    let err = engine
        .execute(ExecutionContext::new(), &code, Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(matches!(err, ExecutionError::CodeTooLarge { max: 1024, .. }));
}

#[tokio::test]
#[serial]
async fn timeout_returns_in_flight_count_to_zero() {
    let engine = engine_with(EngineConfig {
        execution_timeout: Duration::from_millis(200),
        ..config()
    })
    .await
    .0;
    let start = Instant::now();
    let err = engine
        .execute(
            ExecutionContext::new(),
            "let n = 0; while (Date.now() > 0) { n++; } return n;",
            Value::Null,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.retryable());
    assert!(start.elapsed() < Duration::from_secs(2));

    let stats = engine.stats();
    assert_eq!(stats.current, 0);
    assert_eq!(stats.failed, 1);
    let admission = engine.admission();
    assert_eq!(admission.in_use, 0);
    assert_eq!(admission.acquired, admission.released);
    assert_eq!(engine.pool_health().discarded_fatal, 1);
}

#[tokio::test]
#[serial]
async fn promise_all_members_run_concurrently() {
    let engine = engine().await;
    let code = r#"
        const wait = (ms, v) => new Promise(r => setTimeout(() => r(v), ms));
        const values = await Promise.all([wait(100, 'a'), wait(150, 'b'), wait(80, 'c')]);
        return values;
    "#;
    let start = Instant::now();
    let result = engine
        .execute(ExecutionContext::new(), code, Value::Null)
        .await
        .unwrap();
    let elapsed = start.elapsed();
    assert_eq!(result.value, json!(["a", "b", "c"]));
    assert!(elapsed >= Duration::from_millis(145), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(330), "took {elapsed:?}");
}

#[tokio::test]
#[serial]
async fn executions_are_isolated() {
    let engine = engine().await;
    let first = engine
        .execute(
            ExecutionContext::new(),
            "globalThis.shared = 42; return 1;",
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(first.value, json!(1));

    for code in [
        "return typeof globalThis.shared;",
        "await null; return typeof globalThis.shared;",
    ] {
        let result = engine
            .execute(ExecutionContext::new(), code, Value::Null)
            .await
            .unwrap();
        assert_eq!(result.value, json!("undefined"), "leak visible to `{code}`");
    }
}

#[tokio::test]
#[serial]
async fn polluted_pool_runtime_is_discarded() {
    let engine = engine().await;
    engine
        .execute(
            ExecutionContext::new(),
            "Array.prototype.evil = function () { return 1; }; return 0;",
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(engine.pool_health().discarded_dirty, 1);

    let result = engine
        .execute(ExecutionContext::new(), "return typeof [].evil;", Value::Null)
        .await
        .unwrap();
    assert_eq!(result.value, json!("undefined"));
}

#[tokio::test]
#[serial]
async fn intrinsic_writes_do_not_reach_the_next_tenant() {
    let engine = engine_with(EngineConfig {
        pool: PoolConfig {
            min_size: 1,
            max_size: 1,
            ..config().pool
        },
        ..config()
    })
    .await
    .0;

    let targets = [
        "Map",
        "Set",
        "Boolean",
        "RegExp",
        "Proxy",
        "Intl",
        "WeakRef",
        "Map.prototype",
        "Object.getPrototypeOf([][Symbol.iterator]())",
    ];
    for (i, target) in targets.iter().enumerate() {
        let write = format!("{target}.leak = input.secret; return 1;");
        engine
            .execute(ExecutionContext::new(), &write, json!({ "secret": "tenant-a" }))
            .await
            .unwrap();

        let read = format!("return typeof {target}.leak;");
        let seen = engine
            .execute(ExecutionContext::new(), &read, Value::Null)
            .await
            .unwrap();
        assert_eq!(seen.value, json!("undefined"), "{target} leaked across tenants");
        assert_eq!(engine.pool_health().discarded_dirty, i as u64 + 1, "{target}");
    }
}

#[tokio::test]
#[serial]
async fn concurrent_tenants_see_only_their_own_globals() {
    let engine = engine_with(EngineConfig {
        pool: PoolConfig {
            min_size: 2,
            max_size: 4,
            acquire_timeout: Duration::from_secs(10),
            ..config().pool
        },
        execution_timeout: Duration::from_secs(15),
        ..config()
    })
    .await
    .0;

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            // Odd tenants take the event-loop path.
            let prefix = if i % 2 == 1 { "await null; " } else { "" };
            let code = format!(
                "{prefix}globalThis.g_{i} = {i}; Map.m_{i} = {i}; \
                 return [Object.keys(globalThis).filter(k => k.startsWith('g_')), Object.keys(Map)];"
            );
            tokio::spawn(async move {
                engine
                    .execute(ExecutionContext::new(), &code, Value::Null)
                    .await
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let result = task.await.unwrap().unwrap();
        assert_eq!(
            result.value,
            json!([[format!("g_{i}")], [format!("m_{i}")]]),
            "tenant {i}"
        );
    }
    assert_eq!(engine.stats().current, 0);
    assert_eq!(engine.admission().in_use, 0);
}

#[tokio::test]
#[serial]
async fn dropped_caller_still_completes_bookkeeping() {
    let audit = Arc::new(RecordingAudit::default());
    let engine = Engine::with_audit_logger(config(), capabilities(), None, audit.clone())
        .await
        .unwrap();

    let caller = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute(
                    ExecutionContext::new(),
                    "return await new Promise(r => setTimeout(() => r(1), 5000));",
                    Value::Null,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.stats().current, 1);
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    for _ in 0..100 {
        if audit.entries.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(audit.entries.load(Ordering::SeqCst), 1);
    let stats = engine.stats();
    assert_eq!(stats.current, 0);
    assert_eq!(stats.failed, 1);
    let admission = engine.admission();
    assert_eq!(admission.in_use, 0);
    assert_eq!(admission.acquired, admission.released);
    assert_eq!(admission.breaker.counts.requests, 1);
    assert_eq!(admission.breaker.counts.failures, 0);
}

#[tokio::test]
#[serial]
async fn slots_released_exactly_once_on_every_path() {
    let engine = engine_with(EngineConfig {
        execution_timeout: Duration::from_millis(300),
        ..config()
    })
    .await
    .0;
    let codes = [
        "return 1;",
        "throw new Error('boom');",
        "return undefined;",
        "await null; return 2;",
        "await null; throw new TypeError('bad');",
        "let i = 0; while (Date.now() > 0) { i++; } return i;",
        "eval('1')",
    ];
    for code in codes {
        let _ = engine
            .execute(ExecutionContext::new(), code, Value::Null)
            .await;
    }
    let admission = engine.admission();
    assert_eq!(admission.acquired, 6);
    assert_eq!(admission.released, 6);
    assert_eq!(admission.in_use, 0);
    assert_eq!(engine.stats().current, 0);
    assert_eq!(engine.stats().total, codes.len() as u64);
}

#[tokio::test]
#[serial]
async fn concurrency_limit_fails_fast() {
    let engine = engine_with(EngineConfig {
        max_concurrent: 1,
        concurrency_wait: Duration::ZERO,
        ..config()
    })
    .await
    .0;

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute(
                    ExecutionContext::new(),
                    "return await new Promise(r => setTimeout(() => r('done'), 300));",
                    Value::Null,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    let err = engine
        .execute(ExecutionContext::new(), "return 1;", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Concurrency);
    assert!(start.elapsed() < Duration::from_millis(100));

    assert_eq!(slow.await.unwrap().unwrap().value, json!("done"));
    assert_eq!(engine.admission().rejected_concurrency, 1);
}

#[tokio::test]
#[serial]
async fn every_request_over_the_limit_is_rejected() {
    let engine = engine_with(EngineConfig {
        max_concurrent: 2,
        concurrency_wait: Duration::ZERO,
        ..config()
    })
    .await
    .0;

    let slow: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        ExecutionContext::new(),
                        "return await new Promise(r => setTimeout(() => r('held'), 400));",
                        Value::Null,
                    )
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.admission().in_use, 2);

    let extra: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(ExecutionContext::new(), "return 1;", Value::Null)
                    .await
            })
        })
        .collect();
    for task in extra {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecutionError::ConcurrencyLimit { .. }), "{err:?}");
    }

    for task in slow {
        assert_eq!(task.await.unwrap().unwrap().value, json!("held"));
    }
    let admission = engine.admission();
    assert_eq!(admission.rejected_concurrency, 3);
    assert_eq!(admission.acquired, 2);
    assert_eq!(admission.in_use, 0);
    // Rejections never ran, so they leave no breaker outcome.
    assert_eq!(admission.breaker.counts.successes, 2);
    assert_eq!(admission.breaker.state, CircuitState::Closed);
}

#[tokio::test]
#[serial]
async fn tripped_breaker_fails_fast_then_recovers() {
    let engine = engine_with(EngineConfig {
        execution_timeout: Duration::from_millis(100),
        breaker: BreakerConfig {
            min_requests: 2,
            failure_ratio: 0.5,
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_millis(500),
            half_open_max_requests: 2,
        },
        ..config()
    })
    .await
    .0;

    for _ in 0..2 {
        let err = engine
            .execute(
                ExecutionContext::new(),
                "let n = 0; while (Date.now() > 0) { n++; } return n;",
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(err.is_engine_failure(), "{err:?}");
    }
    assert_eq!(engine.admission().breaker.state, CircuitState::Open);

    let dispatched = engine.stats().pool_executions;
    let start = Instant::now();
    let err = engine
        .execute(ExecutionContext::new(), "return 1;", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::CircuitOpen { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Concurrency);
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(engine.stats().pool_executions, dispatched);
    assert_eq!(engine.admission().rejected_breaker, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;

    let trials: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        ExecutionContext::new(),
                        "return await new Promise(r => setTimeout(() => r('ok'), 50));",
                        Value::Null,
                    )
                    .await
            })
        })
        .collect();
    let mut passed = 0;
    let mut refused = 0;
    for task in trials {
        match task.await.unwrap() {
            Ok(result) => {
                assert_eq!(result.value, json!("ok"));
                passed += 1;
            }
            Err(ExecutionError::CircuitOpen { .. }) => refused += 1,
            Err(other) => panic!("unexpected: {other:?}"),
        }
    }
    assert_eq!((passed, refused), (2, 1));
    assert_eq!(engine.admission().breaker.state, CircuitState::Closed);

    let result = engine
        .execute(ExecutionContext::new(), "return 1;", Value::Null)
        .await
        .unwrap();
    assert_eq!(result.value, json!(1));
}

#[tokio::test]
#[serial]
async fn capabilities_match_on_both_paths() {
    let (engine, dispatcher) = engine_with(config()).await;

    let sync = engine
        .execute(
            ExecutionContext::new(),
            "return [typeof echo, Object.keys(crypto), Object.isFrozen(crypto)];",
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(sync.path, Strategy::Pool);

    let asynchronous = engine
        .execute(
            ExecutionContext::new(),
            "await null; return [typeof echo, Object.keys(crypto), Object.isFrozen(crypto)];",
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(asynchronous.path, Strategy::EventLoop);
    assert_eq!(sync.value, asynchronous.value);
    assert_eq!(sync.value, json!(["function", ["randomUUID"], true]));

    let called = engine
        .execute(
            ExecutionContext::new(),
            "const id = await crypto.randomUUID(); return [await echo(input), id];",
            json!({"k": "v"}),
        )
        .await
        .unwrap();
    assert_eq!(
        called.value,
        json!([{"k": "v"}, "00000000-0000-4000-8000-000000000000"])
    );
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[serial]
async fn host_calls_are_bounded() {
    let engine = engine_with(EngineConfig {
        max_host_calls: 2,
        ..config()
    })
    .await
    .0;
    let err = engine
        .execute(
            ExecutionContext::new(),
            "for (let i = 0; i < 3; i++) { await echo(i); } return 'unreachable';",
            Value::Null,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("host call limit exceeded"), "got {err}");
}

#[tokio::test]
#[serial]
async fn timers_fire_in_fifo_order() {
    let engine = engine().await;
    let code = r#"
        const out = [];
        setTimeout(() => out.push('a'), 10);
        setTimeout(() => out.push('b'), 10);
        setTimeout(() => out.push('c'), 0);
        const id = setTimeout(() => out.push('never'), 5);
        clearTimeout(id);
        queueMicrotask(() => out.push('micro'));
        await new Promise(r => setTimeout(r, 40));
        return out;
    "#;
    let result = engine
        .execute(ExecutionContext::new(), code, Value::Null)
        .await
        .unwrap();
    assert_eq!(result.value, json!(["micro", "c", "a", "b"]));
}

#[tokio::test]
#[serial]
async fn user_errors_are_classified_with_hints() {
    let engine = engine().await;
    let err = engine
        .execute(ExecutionContext::new(), "return missing.value;", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Reference);
    assert!(err.hint().is_some());

    let err = engine
        .execute(ExecutionContext::new(), "const x = 1;", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::MissingReturnValue));

    let err = engine
        .execute(ExecutionContext::new(), "export const x = 1;", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyntaxNotSupported);
}

#[tokio::test]
#[serial]
async fn caller_cancellation_stops_execution() {
    let engine = engine().await;
    let ctx = ExecutionContext::new();
    let token = ctx.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let start = Instant::now();
    let err = engine
        .execute(
            ctx,
            "return await new Promise(r => setTimeout(r, 5000));",
            Value::Null,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.admission().in_use, 0);
}

#[tokio::test]
#[serial]
async fn repeated_code_hits_caches() {
    let engine = engine().await;
    for _ in 0..3 {
        engine
            .execute(ExecutionContext::new(), "return 7;", Value::Null)
            .await
            .unwrap();
    }
    assert_eq!(engine.cache_stats().hits, 2);
    assert_eq!(engine.validation_cache_stats().hits, 2);

    let health = serde_json::to_value(engine.health()).unwrap();
    assert_eq!(health["stats"]["success"], 3);
    assert_eq!(health["admission"]["breaker"]["state"], "closed");
}

#[tokio::test]
#[serial]
async fn encoded_code_runs() {
    use base64::Engine as _;
    let engine = engine().await;
    let encoded = base64::engine::general_purpose::STANDARD.encode("return input * 2;");
    let result = engine
        .execute_encoded(ExecutionContext::new(), &encoded, json!(21))
        .await
        .unwrap();
    assert_eq!(result.value, json!(42));
}
