//! Per-request context and results.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::Strategy;

/// Caller-supplied context for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Identifier echoed in logs, audit records and the result.
    pub execution_id: String,
    /// Absolute deadline; the engine uses the earlier of this and its own
    /// execution timeout.
    pub deadline: Option<Instant>,
    /// Fires to stop the execution early.
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Context with a fresh UUID, no deadline and a new token.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Context with the given execution id.
    pub fn with_id(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Set a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Use `token` for cancellation.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Time left before the caller's deadline, capped at `limit`.
    pub fn remaining(&self, limit: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(limit),
            None => limit,
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A successful execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// The value the code returned.
    pub value: serde_json::Value,
    /// Execution identifier from the context.
    pub execution_id: String,
    /// Path the code ran on.
    pub path: Strategy,
    /// Wall time from request to result, in milliseconds.
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_is_capped_by_limit() {
        let ctx = ExecutionContext::new().with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.remaining(Duration::from_secs(1)), Duration::from_secs(1));

        let ctx = ExecutionContext::new().with_timeout(Duration::from_millis(10));
        assert!(ctx.remaining(Duration::from_secs(1)) <= Duration::from_millis(10));

        let ctx = ExecutionContext::with_id("x");
        assert_eq!(ctx.remaining(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn contexts_get_unique_ids() {
        assert_ne!(
            ExecutionContext::new().execution_id,
            ExecutionContext::new().execution_id
        );
    }

    #[test]
    fn result_serializes_duration_in_ms() {
        let result = ExecutionResult {
            value: serde_json::json!(30),
            execution_id: "e".into(),
            path: Strategy::Pool,
            duration: Duration::from_millis(5),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["path"], "pool");
        assert_eq!(json["duration_ms"], 5.0);
        assert_eq!(json["value"], 30);
    }
}
