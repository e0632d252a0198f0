//! Error types for the runbox engine.

use serde::Serialize;
use thiserror::Error;

/// Coarse error category exposed to callers.
///
/// The HTTP layer maps these onto status codes; the engine only guarantees
/// that every failure lands in exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or oversized request, missing or unserializable result.
    Validation,
    /// Banned construct, module or identifier.
    Security,
    /// Construct the sandbox cannot run.
    SyntaxNotSupported,
    /// Parse error reported by the compile step.
    Syntax,
    /// Admission semaphore or circuit breaker rejected the request.
    Concurrency,
    /// Deadline exceeded or caller cancellation.
    Timeout,
    /// Generic exception from user code, or a recovered panic.
    Runtime,
    /// `ReferenceError` thrown by user code.
    Reference,
    /// `TypeError` thrown by user code.
    Type,
    /// Runtime pool had no free runtime within the acquire timeout.
    ResourceExhausted,
    /// V8 heap limit reached.
    MemoryLimit,
}

impl ErrorKind {
    /// Stable name used in logs and structured errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::Security => "SecurityError",
            Self::SyntaxNotSupported => "SyntaxNotSupported",
            Self::Syntax => "SyntaxError",
            Self::Concurrency => "ConcurrencyError",
            Self::Timeout => "TimeoutError",
            Self::Runtime => "RuntimeError",
            Self::Reference => "ReferenceError",
            Self::Type => "TypeError",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::MemoryLimit => "MemoryLimitError",
        }
    }

    /// Classify a JavaScript error by its constructor name, falling back to
    /// inspecting the message.
    pub fn from_js(name: &str, message: &str) -> Self {
        match name {
            "ReferenceError" => return Self::Reference,
            "TypeError" => return Self::Type,
            "SyntaxError" => return Self::Syntax,
            _ => {}
        }
        if message.contains("is not defined") {
            Self::Reference
        } else if message.contains("is not a function")
            || message.contains("Cannot read properties")
            || message.contains("Cannot set properties")
            || message.contains("is not iterable")
        {
            Self::Type
        } else if message.contains("SyntaxError") {
            Self::Syntax
        } else {
            Self::Runtime
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`Engine::execute`](crate::Engine::execute).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Request failed a shape check.
    #[error("validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Serialized input exceeds the configured maximum size.
    #[error("input exceeds maximum size of {max} bytes (got {actual})")]
    InputTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Serialized result exceeds the configured maximum size.
    #[error("result exceeds maximum size of {max} bytes (got {actual})")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The code finished without returning a value.
    #[error("code did not return a value; end the snippet with `return <value>;`")]
    MissingReturnValue,

    /// The returned value cannot be represented as JSON.
    #[error("result is not JSON-serializable: {reason}")]
    ResultNotSerializable {
        /// Serializer message from the sandbox.
        reason: String,
    },

    /// The transport encoding of the code was malformed.
    #[error("invalid code encoding: {reason}")]
    InvalidEncoding {
        /// Decoder message.
        reason: String,
    },

    /// A banned identifier or pattern was found.
    #[error("banned pattern detected: `{pattern}`")]
    BannedPattern {
        /// The pattern that matched.
        pattern: String,
    },

    /// Module loading was attempted.
    #[error("module loading is not allowed: `{module}`")]
    BannedModule {
        /// The requested module, or the loader call when no name was found.
        module: String,
    },

    /// A literal infinite loop was found.
    #[error("infinite loop detected: `{pattern}`")]
    InfiniteLoop {
        /// The loop header that matched.
        pattern: String,
    },

    /// Syntax the sandbox cannot run.
    #[error("unsupported syntax: {construct}")]
    SyntaxNotSupported {
        /// The construct that was found.
        construct: String,
    },

    /// The code failed to parse.
    #[error("syntax error: {message}")]
    SyntaxError {
        /// Parser message with location.
        message: String,
    },

    /// The admission semaphore had no free slot.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Configured slot count.
        max: usize,
    },

    /// The circuit breaker is rejecting requests.
    #[error("circuit breaker open, retry in {retry_after_ms}ms")]
    CircuitOpen {
        /// Time until the breaker allows trials again.
        retry_after_ms: u64,
    },

    /// The execution deadline elapsed.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Effective deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The caller cancelled the execution.
    #[error("execution cancelled by caller")]
    Cancelled,

    /// User code threw.
    #[error("{name}: {message}")]
    JsError {
        /// Classified kind (`Runtime`, `Reference`, `Type` or `Syntax`).
        kind: ErrorKind,
        /// Error constructor name as seen in JavaScript.
        name: String,
        /// Error message.
        message: String,
        /// Stack trace, when JavaScript provided one.
        stack: Option<String>,
    },

    /// No pooled runtime became free in time.
    #[error("no runtime available after waiting {waited_ms}ms")]
    ResourceExhausted {
        /// How long the acquire waited.
        waited_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Engine failure, including recovered panics.
    #[error("internal engine error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl ExecutionError {
    /// Build a [`ExecutionError::JsError`] from the pieces JavaScript reported.
    pub fn js(name: impl Into<String>, message: impl Into<String>, stack: Option<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let kind = ErrorKind::from_js(&name, &message);
        Self::JsError {
            kind,
            name,
            message,
            stack,
        }
    }

    /// Build an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailed { .. }
            | Self::CodeTooLarge { .. }
            | Self::InputTooLarge { .. }
            | Self::OutputTooLarge { .. }
            | Self::MissingReturnValue
            | Self::ResultNotSerializable { .. }
            | Self::InvalidEncoding { .. } => ErrorKind::Validation,
            Self::BannedPattern { .. } | Self::BannedModule { .. } | Self::InfiniteLoop { .. } => {
                ErrorKind::Security
            }
            Self::SyntaxNotSupported { .. } => ErrorKind::SyntaxNotSupported,
            Self::SyntaxError { .. } => ErrorKind::Syntax,
            Self::ConcurrencyLimit { .. } | Self::CircuitOpen { .. } => ErrorKind::Concurrency,
            Self::Timeout { .. } | Self::Cancelled => ErrorKind::Timeout,
            Self::JsError { kind, .. } => *kind,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::HeapLimitExceeded => ErrorKind::MemoryLimit,
            Self::Internal { .. } => ErrorKind::Runtime,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::CodeTooLarge { .. } => "CODE_TOO_LARGE",
            Self::InputTooLarge { .. } => "INPUT_TOO_LARGE",
            Self::OutputTooLarge { .. } => "OUTPUT_TOO_LARGE",
            Self::MissingReturnValue => "MISSING_RETURN_VALUE",
            Self::ResultNotSerializable { .. } => "RESULT_NOT_SERIALIZABLE",
            Self::InvalidEncoding { .. } => "INVALID_ENCODING",
            Self::BannedPattern { .. } => "BANNED_PATTERN",
            Self::BannedModule { .. } => "BANNED_MODULE",
            Self::InfiniteLoop { .. } => "INFINITE_LOOP",
            Self::SyntaxNotSupported { .. } => "SYNTAX_NOT_SUPPORTED",
            Self::SyntaxError { .. } => "SYNTAX_ERROR",
            Self::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::JsError { .. } => "JS_ERROR",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::HeapLimitExceeded => "HEAP_LIMIT_EXCEEDED",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether the caller may retry the same request later.
    ///
    /// The engine itself never retries.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyLimit { .. }
                | Self::CircuitOpen { .. }
                | Self::Timeout { .. }
                | Self::ResourceExhausted { .. }
        )
    }

    /// Whether this failure reflects engine health rather than user code.
    ///
    /// Only these outcomes are recorded as failures by the circuit breaker.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ResourceExhausted { .. }
                | Self::HeapLimitExceeded
                | Self::Internal { .. }
        )
    }

    /// Best-effort remediation hint.
    pub fn hint(&self) -> Option<&'static str> {
        let hint = match self {
            Self::CodeTooLarge { .. } => "Split the work into smaller snippets",
            Self::InputTooLarge { .. } => "Send a smaller input payload",
            Self::OutputTooLarge { .. } => "Return a smaller result, e.g. filter or paginate",
            Self::MissingReturnValue => "Add a `return` statement with the value to send back",
            Self::ResultNotSerializable { .. } => {
                "Return plain objects, arrays, strings, numbers or booleans"
            }
            Self::InvalidEncoding { .. } => "Encode the code as standard base64 of UTF-8 text",
            Self::BannedPattern { .. } => {
                "The sandbox has no access to code generation, reflection or process APIs"
            }
            Self::BannedModule { .. } => {
                "Modules cannot be loaded; use the installed globals such as fetch or crypto"
            }
            Self::InfiniteLoop { .. } => "Give the loop an exit condition",
            Self::SyntaxNotSupported { .. } => {
                "Code runs as a function body; remove import/export statements"
            }
            Self::SyntaxError { .. } => "Fix the syntax error at the reported location",
            Self::ConcurrencyLimit { .. } | Self::CircuitOpen { .. } => {
                "The service is busy; retry after a short backoff"
            }
            Self::Timeout { .. } => "Reduce the work done or await fewer slow operations",
            Self::ResourceExhausted { .. } => "The runtime pool is saturated; retry shortly",
            Self::HeapLimitExceeded => "Reduce memory usage, e.g. avoid building large arrays",
            Self::JsError { kind, .. } => match kind {
                ErrorKind::Reference => {
                    "Check variable names; only `input`, `executionId` and installed globals are in scope"
                }
                ErrorKind::Type => {
                    "Check that values are defined and have the expected type before use"
                }
                ErrorKind::Syntax => "Fix the syntax error at the reported location",
                _ => return None,
            },
            Self::ValidationFailed { .. } | Self::Cancelled | Self::Internal { .. } => return None,
        };
        Some(hint)
    }

    /// Structured JSON form for transport to callers.
    pub fn to_structured_error(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "error": true,
            "kind": self.kind().as_str(),
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });
        if let Some(hint) = self.hint() {
            obj["hint"] = serde_json::Value::String(hint.to_string());
        }
        if let Self::JsError {
            stack: Some(stack), ..
        } = self
        {
            obj["stack"] = serde_json::Value::String(stack.clone());
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_errors_classified_by_name() {
        let err = ExecutionError::js("ReferenceError", "foo is not defined", None);
        assert_eq!(err.kind(), ErrorKind::Reference);
        let err = ExecutionError::js("TypeError", "x.y is not a function", None);
        assert_eq!(err.kind(), ErrorKind::Type);
        let err = ExecutionError::js("RangeError", "Invalid array length", None);
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn js_errors_classified_by_message_when_name_is_generic() {
        let err = ExecutionError::js("Error", "Uncaught ReferenceError: x is not defined", None);
        assert_eq!(err.kind(), ErrorKind::Reference);
        let err = ExecutionError::js("Error", "Cannot read properties of undefined", None);
        assert_eq!(err.kind(), ErrorKind::Type);
        let err = ExecutionError::js("Error", "boom", None);
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn kinds_cover_validation_and_security() {
        assert_eq!(
            ExecutionError::CodeTooLarge { max: 1, actual: 2 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(ExecutionError::MissingReturnValue.kind(), ErrorKind::Validation);
        assert_eq!(
            ExecutionError::InfiniteLoop {
                pattern: "while(true)".into()
            }
            .kind(),
            ErrorKind::Security
        );
        assert_eq!(ExecutionError::Cancelled.kind(), ErrorKind::Timeout);
        assert_eq!(
            ExecutionError::internal("panic").kind(),
            ErrorKind::Runtime
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(ExecutionError::ConcurrencyLimit { max: 4 }.retryable());
        assert!(ExecutionError::ResourceExhausted { waited_ms: 10 }.retryable());
        assert!(ExecutionError::Timeout { timeout_ms: 10 }.retryable());
        assert!(!ExecutionError::MissingReturnValue.retryable());
        assert!(!ExecutionError::js("TypeError", "x", None).retryable());
    }

    #[test]
    fn only_engine_failures_feed_the_breaker() {
        assert!(ExecutionError::Timeout { timeout_ms: 1 }.is_engine_failure());
        assert!(ExecutionError::HeapLimitExceeded.is_engine_failure());
        assert!(ExecutionError::internal("x").is_engine_failure());
        assert!(!ExecutionError::js("TypeError", "x", None).is_engine_failure());
        assert!(!ExecutionError::BannedPattern {
            pattern: "eval(".into()
        }
        .is_engine_failure());
        assert!(!ExecutionError::Cancelled.is_engine_failure());
    }

    #[test]
    fn structured_error_includes_hint_and_stack() {
        let err = ExecutionError::js(
            "ReferenceError",
            "foo is not defined",
            Some("ReferenceError: foo is not defined\n    at <anonymous>:2:1".into()),
        );
        let json = err.to_structured_error();
        assert_eq!(json["kind"], "ReferenceError");
        assert_eq!(json["code"], "JS_ERROR");
        assert_eq!(json["retryable"], false);
        assert!(json["hint"].as_str().unwrap().contains("variable names"));
        assert!(json["stack"].as_str().unwrap().contains("<anonymous>"));
    }

    #[test]
    fn structured_error_omits_absent_hint() {
        let json = ExecutionError::Cancelled.to_structured_error();
        assert!(json.get("hint").is_none());
        assert_eq!(json["kind"], "TimeoutError");
    }
}
