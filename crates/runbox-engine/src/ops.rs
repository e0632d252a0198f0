//! deno_core op definitions for the runbox sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; all actual functions and types are documented below.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use runbox_error::DispatchError;

use crate::HostDispatcher;

/// Per-execution bounds on host capability calls.
pub struct HostCallLimits {
    /// Maximum number of host calls allowed.
    pub max_calls: usize,
    /// Maximum size of serialized arguments per call.
    pub max_args_size: usize,
    /// Number of host calls made so far.
    pub calls_made: usize,
}

impl HostCallLimits {
    /// Fresh limits with no calls made.
    pub fn new(max_calls: usize, max_args_size: usize) -> Self {
        Self {
            max_calls,
            max_args_size,
            calls_made: 0,
        }
    }
}

/// Capabilities installed in this runtime and the methods each exposes.
///
/// `None` means the capability is a plain function.
pub struct KnownCapabilities(pub HashMap<String, Option<Vec<String>>>);

impl KnownCapabilities {
    /// `(capability, method)` pairs; plain functions are listed as `call`.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::new();
        for (name, methods) in &self.0 {
            match methods {
                None => pairs.push((name.as_str(), "call")),
                Some(methods) => pairs.extend(methods.iter().map(|m| (name.as_str(), m.as_str()))),
            }
        }
        pairs
    }
}

/// Turn a dispatch failure into a JS error, appending any suggested fix.
fn reject(err: DispatchError, known: Option<&KnownCapabilities>) -> JsErrorBox {
    let pairs = known.map(KnownCapabilities::pairs);
    let structured = err.to_structured_error(pairs.as_deref());
    let mut message = err.to_string();
    if let Some(fix) = structured.get("suggested_fix").and_then(|v| v.as_str()) {
        message.push_str(". ");
        message.push_str(fix);
    }
    JsErrorBox::generic(message)
}

/// JSON envelope `{"input": ..., "executionId": ...}` waiting to be read by
/// the next execution.
pub struct PendingInput(pub String);

/// JSON envelope reported by the sandbox when the user function settles.
pub struct SettledResult(pub String);

/// Outcome of the post-execution integrity check.
pub struct IntegrityReport(pub bool);

/// Route `console.*` output from sandbox code to tracing.
#[op2(fast)]
pub fn op_runbox_log(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::warn!(target: "runbox::sandbox::js", console = level, "{}", msg),
        "debug" => tracing::debug!(target: "runbox::sandbox::js", console = level, "{}", msg),
        _ => tracing::info!(target: "runbox::sandbox::js", console = level, "{}", msg),
    }
}

/// Hand the pending input envelope to the sandbox. Each envelope is read
/// at most once.
#[op2]
#[string]
pub fn op_runbox_take_input(state: &mut OpState) -> String {
    state
        .try_take::<PendingInput>()
        .map(|p| p.0)
        .unwrap_or_else(|| r#"{"input":null,"executionId":""}"#.to_string())
}

/// Store the settled result. Only the first report per execution is kept.
#[op2(fast)]
pub fn op_runbox_set_result(state: &mut OpState, #[string] json: &str) {
    if !state.has::<SettledResult>() {
        state.put(SettledResult(json.to_string()));
    }
}

/// Store the integrity check outcome.
#[op2(fast)]
pub fn op_runbox_report_integrity(state: &mut OpState, clean: bool) {
    state.put(IntegrityReport(clean));
}

/// Sleep for `ms` milliseconds. Drives the sandbox timer queue.
#[op2(async)]
pub async fn op_runbox_sleep(#[smi] ms: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
}

/// Call a host capability via the [`HostDispatcher`].
///
/// Enforces per-execution call count and argument size limits via
/// [`HostCallLimits`] stored in OpState, and rejects capabilities or methods
/// that were not installed.
#[op2(async)]
#[string]
pub async fn op_runbox_host_call(
    op_state: Rc<RefCell<OpState>>,
    #[string] capability: String,
    #[string] method: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(
        capability = %capability,
        method = %method,
        args_len = args_json.len(),
        "host call dispatched"
    );

    {
        let mut st = op_state.borrow_mut();
        if let Some(known) = st.try_borrow::<KnownCapabilities>() {
            match known.0.get(&capability) {
                None => {
                    let err = DispatchError::CapabilityNotFound(capability.clone());
                    return Err(reject(err, Some(known)));
                }
                Some(Some(methods)) if !methods.iter().any(|m| m == &method) => {
                    let err = DispatchError::MethodNotFound {
                        capability: capability.clone(),
                        method: method.clone(),
                    };
                    return Err(reject(err, Some(known)));
                }
                Some(_) => {}
            }
        }

        let limits = st
            .try_borrow_mut::<HostCallLimits>()
            .ok_or_else(|| JsErrorBox::generic("host calls are not available"))?;
        if limits.calls_made >= limits.max_calls {
            return Err(JsErrorBox::generic(format!(
                "host call limit exceeded (max {} calls per execution)",
                limits.max_calls
            )));
        }
        if args_json.len() > limits.max_args_size {
            return Err(JsErrorBox::generic(format!(
                "host call args too large ({} bytes, max {} bytes)",
                args_json.len(),
                limits.max_args_size
            )));
        }
        limits.calls_made += 1;
    }

    let dispatcher = {
        let st = op_state.borrow();
        st.try_borrow::<Arc<dyn HostDispatcher>>()
            .cloned()
            .ok_or_else(|| JsErrorBox::generic("no host dispatcher configured"))?
    };

    let args: serde_json::Value = serde_json::from_str(&args_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid JSON args: {e}")))?;

    let result = dispatcher
        .call(&capability, &method, args)
        .await
        .map_err(|e| {
            tracing::debug!(capability = %capability, method = %method, code = e.code(), "host call failed");
            reject(e, None)
        })?;

    serde_json::to_string(&result)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

deno_core::extension!(
    runbox_ext,
    ops = [
        op_runbox_log,
        op_runbox_take_input,
        op_runbox_set_result,
        op_runbox_report_integrity,
        op_runbox_sleep,
        op_runbox_host_call
    ],
);
