#![warn(missing_docs)]

//! # runbox-engine
//!
//! Execution engine for untrusted JavaScript snippets in a multi-tenant
//! service.
//!
//! Turns a code string plus a JSON input into a JSON result while isolating
//! the code from the host and bounding time, memory and concurrency. The
//! embedded interpreter is V8 via `deno_core`; this crate pools, schedules,
//! bounds and secures it.
//!
//! ## Request flow
//!
//! 1. [`validator::SecurityValidator`] rejects dangerous code up front
//! 2. [`compile::Compiler`] classifies the code with
//!    [`analyzer::CodeAnalyzer`] and syntax-checks it (both cached)
//! 3. [`admission::AdmissionController`] takes a concurrency slot and
//!    consults the [`circuit_breaker::CircuitBreaker`]
//! 4. Synchronous code runs on a warm runtime from the
//!    [`pool::RuntimePool`]; asynchronous code gets a fresh runtime and
//!    event loop from the [`event_loop::EventLoopExecutor`]
//! 5. The [`Engine`] exports the result, feeds the breaker and statistics,
//!    and releases everything it took on every path
//!
//! ## Isolation model
//!
//! - **One isolate per thread**: V8 isolates are `!Send`, so every runtime
//!   lives on a dedicated OS thread with a current-thread tokio runtime
//! - **No ambient capabilities**: no fs, net, env or module loading; the
//!   only bridge to the host is the [`HostDispatcher`]
//! - **Discard, never reset**: a pooled runtime whose globals may have been
//!   touched, or whose execution timed out, is destroyed and replaced

pub mod admission;
pub mod analyzer;
pub mod audit;
pub mod bootstrap;
pub mod cache;
pub mod circuit_breaker;
pub mod compile;
pub mod coordinator;
pub mod error;
pub mod event_loop;
pub mod lexer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod pool;
pub mod request;
pub mod runtime;
pub mod stats;
pub mod validator;

use std::collections::HashMap;

pub use analyzer::{CodeFeatures, Strategy};
pub use coordinator::{Engine, EngineConfig, HealthReport};
pub use error::{ErrorKind, ExecutionError};
pub use request::{ExecutionContext, ExecutionResult};
pub use runbox_error::DispatchError;

/// Trait for dispatching host capability calls made by sandboxed code.
///
/// Implementations own the real capability modules (an SSRF-guarded HTTP
/// client, crypto, URL parsing). Sandbox code only sees the globals
/// described by a [`CapabilitySet`]; every call on them lands here.
#[async_trait::async_trait]
pub trait HostDispatcher: Send + Sync {
    /// Call `method` on `capability`.
    ///
    /// - `capability`: the global name (e.g. "fetch", "crypto")
    /// - `method`: the method name, or `"call"` for function capabilities
    /// - `args`: the call arguments as a JSON array
    async fn call(
        &self,
        capability: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DispatchError>;
}

/// How a capability appears in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityShape {
    /// A callable global, like `fetch(url, init)`.
    Function,
    /// A frozen object of methods, like `crypto.randomUUID()`.
    Namespace(Vec<String>),
}

/// One global installed into every runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    /// Global name.
    pub name: String,
    /// Callable shape.
    pub shape: CapabilityShape,
}

impl Capability {
    /// A function-shaped capability.
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: CapabilityShape::Function,
        }
    }

    /// A namespace-shaped capability exposing `methods`.
    pub fn namespace<I, S>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            shape: CapabilityShape::Namespace(methods.into_iter().map(Into::into).collect()),
        }
    }

    /// Method names for namespaces, `None` for functions.
    pub fn methods(&self) -> Option<&[String]> {
        match &self.shape {
            CapabilityShape::Function => None,
            CapabilityShape::Namespace(methods) => Some(methods),
        }
    }
}

/// The capability globals installed on both execution paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    capabilities: Vec<Capability>,
}

impl CapabilitySet {
    /// Create a set from a list of capabilities.
    pub fn new(capabilities: Vec<Capability>) -> Self {
        Self { capabilities }
    }

    /// Iterate over the capabilities.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    /// Number of capabilities.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Whether no capabilities are installed.
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// `(capability, method)` pairs, for "did you mean" suggestions.
    pub fn known_methods(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::new();
        for cap in &self.capabilities {
            match cap.methods() {
                None => pairs.push((cap.name.as_str(), "call")),
                Some(methods) => {
                    pairs.extend(methods.iter().map(|m| (cap.name.as_str(), m.as_str())))
                }
            }
        }
        pairs
    }

    pub(crate) fn to_known(&self) -> HashMap<String, Option<Vec<String>>> {
        self.capabilities
            .iter()
            .map(|c| (c.name.clone(), c.methods().map(<[String]>::to_vec)))
            .collect()
    }
}
