//! A bootstrapped V8 runtime and the worker thread that owns it.
//!
//! V8 isolates are `!Send`, so every [`SandboxRuntime`] is created, used
//! and dropped on one dedicated OS thread running a current-thread tokio
//! runtime. The event-loop path builds one per execution; the pool keeps
//! long-lived ones behind a [`PooledRuntime`] handle that forwards jobs over
//! a channel.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{build_bootstrap, SEAL_SCRIPT, VERIFY_SCRIPT};
use crate::compile::CompiledProgram;
use crate::error::ExecutionError;
use crate::ops::{
    runbox_ext, HostCallLimits, IntegrityReport, KnownCapabilities, PendingInput, SettledResult,
};
use crate::{CapabilitySet, HostDispatcher};

/// Grace granted past the heap limit so termination can unwind.
const HEAP_GRACE: usize = 1024 * 1024;

/// Everything needed to build identical runtimes on either path.
pub struct RuntimeSettings {
    bootstrap: Arc<str>,
    max_heap_size: usize,
    dispatcher: Option<Arc<dyn HostDispatcher>>,
    capabilities: HashMap<String, Option<Vec<String>>>,
    max_host_calls: usize,
    max_host_call_args_size: usize,
}

impl RuntimeSettings {
    /// Build settings, rendering the bootstrap script once.
    pub fn new(
        capabilities: &CapabilitySet,
        disabled_globals: &[String],
        max_heap_size: usize,
        dispatcher: Option<Arc<dyn HostDispatcher>>,
        max_host_calls: usize,
        max_host_call_args_size: usize,
    ) -> Result<Self, ExecutionError> {
        let bootstrap = build_bootstrap(capabilities, disabled_globals)
            .map_err(|e| ExecutionError::internal(format!("bootstrap rendering failed: {e}")))?;
        Ok(Self {
            bootstrap: bootstrap.into(),
            max_heap_size,
            dispatcher,
            capabilities: capabilities.to_known(),
            max_host_calls,
            max_host_call_args_size,
        })
    }
}

/// Split a V8 exception string like `Uncaught RangeError: boom` into an error.
fn core_error(text: &str) -> ExecutionError {
    let first = text.lines().next().unwrap_or_default();
    let first = first.strip_prefix("Uncaught ").unwrap_or(first);
    match first.split_once(": ") {
        Some((name, message))
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ExecutionError::js(name, message, None)
        }
        _ => ExecutionError::js("Error", first, None),
    }
}

/// Decode the envelope reported by the bootstrap's `settle`/`fail`.
fn decode_settled(envelope: &str) -> Result<String, ExecutionError> {
    if let Some(json) = envelope
        .strip_prefix(r#"{"ok":"#)
        .and_then(|rest| rest.strip_suffix('}'))
    {
        return Ok(json.to_string());
    }

    let value: serde_json::Value = serde_json::from_str(envelope)
        .map_err(|e| ExecutionError::internal(format!("malformed result envelope: {e}")))?;
    if let Some(error) = value.get("error") {
        let field = |key: &str| error.get(key).and_then(|v| v.as_str());
        return Err(ExecutionError::js(
            field("name").unwrap_or("Error"),
            field("message").unwrap_or_default(),
            field("stack").map(str::to_string),
        ));
    }
    if value.get("missing").is_some() {
        return Err(ExecutionError::MissingReturnValue);
    }
    if let Some(reason) = value.get("unserializable") {
        return Err(ExecutionError::ResultNotSerializable {
            reason: reason.as_str().unwrap_or("unknown").to_string(),
        });
    }
    Err(ExecutionError::internal("unrecognized result envelope"))
}

/// A bootstrapped, sealed V8 runtime.
pub struct SandboxRuntime {
    runtime: JsRuntime,
    heap_exceeded: Arc<AtomicBool>,
    settings: Arc<RuntimeSettings>,
}

impl SandboxRuntime {
    /// Create a runtime, install the bootstrap and seal the integrity
    /// baseline. Must be called on the thread that will own it.
    pub async fn new(settings: Arc<RuntimeSettings>) -> Result<Self, ExecutionError> {
        let create_params = v8::CreateParams::default().heap_limits(0, settings.max_heap_size);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![runbox_ext::init_ops_and_esm()],
            create_params: Some(create_params),
            ..Default::default()
        });

        {
            let op_state = runtime.op_state();
            let mut st = op_state.borrow_mut();
            if let Some(d) = settings.dispatcher.clone() {
                st.put(d);
            }
            st.put(KnownCapabilities(settings.capabilities.clone()));
        }

        let heap_exceeded = Arc::new(AtomicBool::new(false));
        let flag = heap_exceeded.clone();
        let handle = runtime.v8_isolate().thread_safe_handle();
        runtime.add_near_heap_limit_callback(move |current, _initial| {
            flag.store(true, Ordering::SeqCst);
            handle.terminate_execution();
            current + HEAP_GRACE
        });

        runtime
            .execute_script("[runbox:bootstrap]", settings.bootstrap.to_string())
            .map_err(|e| ExecutionError::internal(format!("bootstrap failed: {e}")))?;
        runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(|e| ExecutionError::internal(format!("bootstrap event loop failed: {e}")))?;
        runtime
            .execute_script("[runbox:seal]", SEAL_SCRIPT.to_string())
            .map_err(|e| ExecutionError::internal(format!("seal failed: {e}")))?;

        Ok(Self {
            runtime,
            heap_exceeded,
            settings,
        })
    }

    /// Thread-safe handle for interrupting this runtime from another thread.
    pub fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Whether the heap limit callback has fired.
    pub fn heap_exceeded(&self) -> bool {
        self.heap_exceeded.load(Ordering::SeqCst)
    }

    /// Run `program` with the JSON `envelope` and return the result as JSON
    /// text.
    ///
    /// Synchronous code settles inside `execute_script`; anything else
    /// drives the event loop until the user function settles or `cancel`
    /// fires. Timers still pending after the result is reported are left
    /// for the caller to discard.
    pub async fn run(
        &mut self,
        program: &CompiledProgram,
        envelope: String,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError> {
        {
            let op_state = self.runtime.op_state();
            let mut st = op_state.borrow_mut();
            st.try_take::<SettledResult>();
            st.put(PendingInput(envelope));
            st.put(HostCallLimits::new(
                self.settings.max_host_calls,
                self.settings.max_host_call_args_size,
            ));
        }

        if let Err(e) = self
            .runtime
            .execute_script("[runbox:execute]", program.script.to_string())
        {
            return Err(self.classify_failure(&e.to_string()));
        }

        if !self.has_result() {
            let runtime = &mut self.runtime;
            let settled = tokio::select! {
                r = poll_until_settled(runtime) => r,
                _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            };
            if let Err(e) = settled {
                return Err(match e {
                    ExecutionError::JsError { .. } if self.heap_exceeded() => {
                        ExecutionError::HeapLimitExceeded
                    }
                    other => other,
                });
            }
        }

        let envelope = self
            .runtime
            .op_state()
            .borrow_mut()
            .try_take::<SettledResult>()
            .map(|r| r.0)
            .ok_or_else(|| ExecutionError::internal("no result reported"))?;
        decode_settled(&envelope)
    }

    /// Run the integrity check; `true` means the runtime may be reused.
    pub fn verify(&mut self) -> bool {
        self.runtime
            .op_state()
            .borrow_mut()
            .try_take::<IntegrityReport>();
        if self
            .runtime
            .execute_script("[runbox:verify]", VERIFY_SCRIPT.to_string())
            .is_err()
        {
            return false;
        }
        self.runtime
            .op_state()
            .borrow_mut()
            .try_take::<IntegrityReport>()
            .is_some_and(|r| r.0)
    }

    fn has_result(&mut self) -> bool {
        self.runtime.op_state().borrow().has::<SettledResult>()
    }

    fn classify_failure(&self, text: &str) -> ExecutionError {
        if self.heap_exceeded() {
            ExecutionError::HeapLimitExceeded
        } else {
            core_error(text)
        }
    }
}

/// Drive the event loop until a result has been reported.
async fn poll_until_settled(runtime: &mut JsRuntime) -> Result<(), ExecutionError> {
    poll_fn(|cx| {
        let settled = |rt: &mut JsRuntime| rt.op_state().borrow().has::<SettledResult>();
        if settled(runtime) {
            return Poll::Ready(Ok(()));
        }
        match runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
            Poll::Ready(Ok(())) if settled(runtime) => Poll::Ready(Ok(())),
            Poll::Ready(Ok(())) => Poll::Ready(Err(ExecutionError::js(
                "Error",
                "promise never settled",
                None,
            ))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(core_error(&e.to_string()))),
            Poll::Pending if settled(runtime) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

struct Job {
    program: Arc<CompiledProgram>,
    envelope: String,
    cancel: CancellationToken,
    reply: oneshot::Sender<JobReply>,
}

/// Outcome of one pooled execution.
#[derive(Debug)]
pub struct JobReply {
    /// Result JSON or the execution error.
    pub result: Result<String, ExecutionError>,
    /// Whether the runtime passed its integrity check and stays alive.
    pub clean: bool,
}

/// Handle to a long-lived runtime on its own thread.
///
/// Dropping the handle closes the job channel; the worker thread then
/// drops its runtime and exits.
pub struct PooledRuntime {
    id: u64,
    jobs: mpsc::UnboundedSender<Job>,
    isolate: v8::IsolateHandle,
    created_at: Instant,
    pub(crate) idle_since: Instant,
    pub(crate) uses: u32,
}

impl std::fmt::Debug for PooledRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledRuntime")
            .field("id", &self.id)
            .field("uses", &self.uses)
            .finish_non_exhaustive()
    }
}

impl PooledRuntime {
    /// Start a worker thread and wait until its runtime is sealed.
    pub async fn spawn(id: u64, settings: Arc<RuntimeSettings>) -> Result<Self, ExecutionError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name(format!("runbox-rt-{id}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if ready_tx.send(Err(ExecutionError::internal(e.to_string()))).is_err() {
                            tracing::warn!(runtime_id = id, "runtime ready receiver dropped");
                        }
                        return;
                    }
                };
                rt.block_on(worker_loop(id, settings, ready_tx, jobs_rx));
            })
            .map_err(|e| ExecutionError::internal(format!("failed to spawn runtime thread: {e}")))?;

        let isolate = ready_rx
            .await
            .map_err(|_| ExecutionError::internal("sandbox thread panicked"))??;

        let now = Instant::now();
        tracing::debug!(runtime_id = id, "runtime ready");
        Ok(Self {
            id,
            jobs: jobs_tx,
            isolate,
            created_at: now,
            idle_since: now,
            uses: 0,
        })
    }

    /// Runtime identifier, unique within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the runtime was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of executions this runtime has served.
    pub fn uses(&self) -> u32 {
        self.uses
    }

    /// Queue one execution; the reply arrives on the returned receiver.
    pub(crate) fn submit(
        &self,
        program: Arc<CompiledProgram>,
        envelope: String,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<JobReply>, ExecutionError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job {
                program,
                envelope,
                cancel,
                reply,
            })
            .map_err(|_| ExecutionError::internal("runtime thread has exited"))?;
        Ok(rx)
    }

    /// Interrupt whatever the runtime is executing.
    pub fn terminate(&self) {
        self.isolate.terminate_execution();
    }
}

/// Errors after which the isolate is still consistent enough to verify.
fn survivable(result: &Result<String, ExecutionError>) -> bool {
    matches!(
        result,
        Ok(_)
            | Err(ExecutionError::JsError { .. })
            | Err(ExecutionError::MissingReturnValue)
            | Err(ExecutionError::ResultNotSerializable { .. })
    )
}

async fn worker_loop(
    id: u64,
    settings: Arc<RuntimeSettings>,
    ready: oneshot::Sender<Result<v8::IsolateHandle, ExecutionError>>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    let mut sandbox = match SandboxRuntime::new(settings).await {
        Ok(s) => s,
        Err(e) => {
            if ready.send(Err(e)).is_err() {
                tracing::warn!(runtime_id = id, "runtime ready receiver dropped");
            }
            return;
        }
    };
    if ready.send(Ok(sandbox.isolate_handle())).is_err() {
        return;
    }

    while let Some(job) = jobs.recv().await {
        let result = sandbox.run(&job.program, job.envelope, &job.cancel).await;
        let clean = survivable(&result) && !sandbox.heap_exceeded() && sandbox.verify();
        if job.reply.send(JobReply { result, clean }).is_err() {
            tracing::warn!(runtime_id = id, "execution reply receiver dropped");
        }
        if !clean {
            tracing::debug!(runtime_id = id, "runtime retired after execution");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::CodeAnalyzer;
    use crate::compile::Compiler;
    use crate::error::ErrorKind;
    use crate::validator::SecurityValidator;

    fn compiler() -> Compiler {
        Compiler::new(
            SecurityValidator::default(),
            CodeAnalyzer::new(&CapabilitySet::default()),
            16,
            16,
            1,
        )
    }

    fn settings(max_heap_size: usize) -> Arc<RuntimeSettings> {
        Arc::new(
            RuntimeSettings::new(
                &CapabilitySet::default(),
                &[],
                max_heap_size,
                None,
                16,
                64 * 1024,
            )
            .unwrap(),
        )
    }

    fn envelope(input: serde_json::Value) -> String {
        serde_json::json!({ "input": input, "executionId": "test" }).to_string()
    }

    #[test]
    fn core_error_splits_name_and_message() {
        let err = core_error("Uncaught RangeError: too deep\n    at <anon>");
        match err {
            ExecutionError::JsError { name, message, .. } => {
                assert_eq!(name, "RangeError");
                assert_eq!(message, "too deep");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            core_error("execution terminated"),
            ExecutionError::JsError { ref name, .. } if name == "Error"
        ));
    }

    #[test]
    fn decode_settled_envelopes() {
        assert_eq!(decode_settled(r#"{"ok":{"a":1}}"#).unwrap(), r#"{"a":1}"#);
        assert!(matches!(
            decode_settled(r#"{"missing":true}"#),
            Err(ExecutionError::MissingReturnValue)
        ));
        assert!(matches!(
            decode_settled(r#"{"unserializable":"cyclic"}"#),
            Err(ExecutionError::ResultNotSerializable { .. })
        ));
        let err = decode_settled(r#"{"error":{"name":"TypeError","message":"x","stack":null}}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[tokio::test]
    async fn pooled_runtime_runs_sync_code() {
        let program = compiler().compile("return input.a + input.b;").unwrap();
        let rt = PooledRuntime::spawn(1, settings(64 * 1024 * 1024))
            .await
            .unwrap();
        let reply = rt
            .submit(
                program,
                envelope(serde_json::json!({"a": 10, "b": 20})),
                CancellationToken::new(),
            )
            .unwrap()
            .await
            .unwrap();
        assert_eq!(reply.result.unwrap(), "30");
        assert!(reply.clean);
    }

    #[tokio::test]
    async fn thrown_errors_keep_runtime_clean() {
        let program = compiler()
            .compile("throw new TypeError('bad input');")
            .unwrap();
        let rt = PooledRuntime::spawn(2, settings(64 * 1024 * 1024))
            .await
            .unwrap();
        let reply = rt
            .submit(program, envelope(serde_json::Value::Null), CancellationToken::new())
            .unwrap()
            .await
            .unwrap();
        let err = reply.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        assert!(reply.clean);
    }

    #[tokio::test]
    async fn global_writes_mark_runtime_dirty() {
        let program = compiler()
            .compile("Object.prototype.polluted = 1; return 1;")
            .unwrap();
        let rt = PooledRuntime::spawn(3, settings(64 * 1024 * 1024))
            .await
            .unwrap();
        let reply = rt
            .submit(program, envelope(serde_json::Value::Null), CancellationToken::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(reply.result.unwrap(), "1");
        assert!(!reply.clean);
    }

    async fn run_once(id: u64, code: &str) -> JobReply {
        let program = compiler().compile(code).unwrap();
        let rt = PooledRuntime::spawn(id, settings(64 * 1024 * 1024))
            .await
            .unwrap();
        rt.submit(program, envelope(serde_json::Value::Null), CancellationToken::new())
            .unwrap()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn writes_to_any_reachable_intrinsic_mark_runtime_dirty() {
        let snippets = [
            "Map.leak = 1; return 1;",
            "Set.leak = 1; return 1;",
            "Boolean.leak = 1; return 1;",
            "RegExp.leak = 1; return 1;",
            "Proxy.leak = 1; return 1;",
            "const R = Reflect; R.leak = 1; return 1;",
            "Intl.leak = 1; return 1;",
            "WeakRef.leak = 1; return 1;",
            "Map.prototype.leak = 1; return 1;",
            "Object.getPrototypeOf([][Symbol.iterator]()).leak = 1; return 1;",
            "Object.getPrototypeOf(new Map().entries()).leak = 1; return 1;",
            "Math.max.leak = 1; return 1;",
            "console.log.leak = 1; return 1;",
            "delete Map.prototype.clear; return 1;",
            "Object.freeze(Set); return 1;",
        ];
        for (i, code) in snippets.iter().enumerate() {
            let reply = run_once(100 + i as u64, code).await;
            assert_eq!(reply.result.unwrap(), "1", "{code}");
            assert!(!reply.clean, "{code} left the runtime clean");
        }
    }

    #[tokio::test]
    async fn ordinary_builtin_use_keeps_runtime_clean() {
        let reply = run_once(
            200,
            "const m = new Map([[1, 2]]); \
             const s = new Set([...m.keys(), 3]); \
             const hit = /a(b)/.exec('ab'); \
             const d = (1234).toFixed(1); \
             return [...s].length + hit[1].length + d.length;",
        )
        .await;
        assert_eq!(reply.result.unwrap(), "9");
        assert!(reply.clean);
    }

    #[tokio::test]
    async fn heap_limit_is_reported() {
        let program = compiler()
            .compile(
                "const arr = []; for (let i = 0; i < 1e9; i++) { arr.push(new Array(100000).fill('x')); } return arr.length;",
            )
            .unwrap();
        let rt = PooledRuntime::spawn(4, settings(10 * 1024 * 1024))
            .await
            .unwrap();
        let reply = rt
            .submit(program, envelope(serde_json::Value::Null), CancellationToken::new())
            .unwrap()
            .await
            .unwrap();
        let err = reply.result.unwrap_err();
        assert!(
            matches!(
                err,
                ExecutionError::HeapLimitExceeded | ExecutionError::JsError { .. }
            ),
            "expected heap limit or JS error, got: {err:?}"
        );
        assert!(!reply.clean);
    }

    #[tokio::test]
    async fn sandbox_runtime_awaits_timers() {
        let program = compiler()
            .compile("return await new Promise(r => setTimeout(() => r(input), 20));")
            .unwrap();
        let mut sandbox = SandboxRuntime::new(settings(64 * 1024 * 1024))
            .await
            .unwrap();
        let out = sandbox
            .run(&program, envelope(serde_json::json!(7)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "7");
    }

    #[tokio::test]
    async fn cancellation_stops_pending_work() {
        let program = compiler()
            .compile("return await new Promise(() => {});")
            .unwrap();
        let mut sandbox = SandboxRuntime::new(settings(64 * 1024 * 1024))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sandbox
            .run(&program, envelope(serde_json::Value::Null), &cancel)
            .await
            .unwrap_err();
        // A promise that never resolves with no pending ops ends the loop.
        assert!(
            matches!(err, ExecutionError::Cancelled | ExecutionError::JsError { .. }),
            "got {err:?}"
        );
    }
}
