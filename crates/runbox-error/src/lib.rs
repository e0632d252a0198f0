//! Typed error types for runbox host capability dispatch.
//!
//! Provides [`DispatchError`], the canonical error type returned by a
//! `HostDispatcher` when sandboxed code calls a host capability such as
//! `fetch` or `crypto.randomUUID`.

use thiserror::Error;

/// Canonical error type for host capability calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The capability is not provided by this host.
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    /// The capability exists but does not expose the requested method.
    #[error("method not found: '{method}' on capability '{capability}'")]
    MethodNotFound {
        /// The capability that was called.
        capability: String,
        /// The method name that was not found.
        method: String,
    },

    /// The host call timed out.
    #[error("timeout after {timeout_ms}ms calling '{capability}'")]
    Timeout {
        /// The capability that timed out.
        capability: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// A host policy (SSRF guard, allow-list) refused the call.
    #[error("denied by host policy: {reason}")]
    Denied {
        /// Why the call was refused.
        reason: String,
    },

    /// The upstream service behind the capability failed.
    #[error("upstream error from '{capability}': {message}")]
    Upstream {
        /// The capability whose backend failed.
        capability: String,
        /// The upstream error message.
        message: String,
    },

    /// A per-execution limit was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapabilityNotFound(_) => "CAPABILITY_NOT_FOUND",
            Self::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Denied { .. } => "DENIED",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the call may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Upstream { .. } | Self::RateLimit(_) => true,
            Self::CapabilityNotFound(_)
            | Self::MethodNotFound { .. }
            | Self::Denied { .. }
            | Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error for the sandboxed caller.
    ///
    /// `known_methods` is an optional list of `(capability, method)` pairs
    /// used to suggest a fix for misspelled capability or method names.
    pub fn to_structured_error(&self, known_methods: Option<&[(&str, &str)]>) -> serde_json::Value {
        let suggested_fix = match self {
            Self::MethodNotFound { capability, method } => {
                known_methods.and_then(|known| find_similar_method(capability, method, known))
            }
            Self::CapabilityNotFound(name) => {
                known_methods.and_then(|known| find_similar_capability(name, known))
            }
            Self::Timeout { .. } => Some("Retry with a smaller request".to_string()),
            Self::RateLimit(_) => Some("Make fewer host calls per execution".to_string()),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Closest method on the same capability within edit distance 3.
fn find_similar_method(
    capability: &str,
    method: &str,
    known: &[(&str, &str)],
) -> Option<String> {
    let mut best: Option<(usize, String)> = None;
    for &(c, m) in known {
        if c != capability {
            continue;
        }
        let dist = strsim::levenshtein(method, m);
        if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
            best = Some((dist, format!("Did you mean '{capability}.{m}'?")));
        }
    }
    best.map(|(_, suggestion)| suggestion)
}

fn find_similar_capability(name: &str, known: &[(&str, &str)]) -> Option<String> {
    let mut best: Option<(usize, String)> = None;
    for &(c, _) in known {
        let dist = strsim::levenshtein(name, c);
        if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
            best = Some((dist, format!("Did you mean '{c}'?")));
        }
    }
    best.map(|(_, suggestion)| suggestion)
}

// DispatchError crosses thread boundaries between V8 worker threads and the host.
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<DispatchError>();
};
