//! Static sync/async classification of snippets.
//!
//! Synchronous code runs on a warm pooled runtime; anything that needs the
//! event loop to make progress runs on a fresh event-loop runtime. When in
//! doubt the classifier answers async.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::lexer;
use crate::CapabilitySet;

/// Which execution path a snippet takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Reused runtime from the pool.
    Pool,
    /// Fresh runtime driven by its own event loop.
    EventLoop,
}

impl Strategy {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::EventLoop => "event_loop",
        }
    }
}

/// Result of classifying a snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeFeatures {
    /// Whether the code needs the event loop.
    pub is_async: bool,
    /// Name of the first pattern that matched, if any.
    pub reason: Option<&'static str>,
    /// Selected execution path.
    pub strategy: Strategy,
}

impl CodeFeatures {
    fn sync() -> Self {
        Self {
            is_async: false,
            reason: None,
            strategy: Strategy::Pool,
        }
    }

    fn asynchronous(reason: &'static str) -> Self {
        Self {
            is_async: true,
            reason: Some(reason),
            strategy: Strategy::EventLoop,
        }
    }
}

/// Matched against comment text only.
static FORCE_ASYNC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@async\b").expect("static regex is valid"));

/// Matched in order against stripped code; first match wins.
static CODE_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("promise_construction", r"\bnew\s+Promise\b"),
        (
            "promise_combinator",
            r"\bPromise\s*\.\s*(all|allSettled|any|race|resolve|reject)\b",
        ),
        ("promise_chain", r"\.\s*(then|catch|finally)\s*\("),
        (
            "timer",
            r"\b(setTimeout|setInterval|setImmediate|queueMicrotask)\s*\(",
        ),
        ("async_keyword", r"\basync\b"),
        ("await_keyword", r"\bawait\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("static regex is valid")))
    .collect()
});

/// Tokens checked by [`is_likely_async`].
const ASYNC_HINTS: &[&str] = &[
    "async",
    "await",
    "Promise",
    ".then(",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "queueMicrotask",
];

/// Classifies code as sync or async over lexed source.
#[derive(Debug)]
pub struct CodeAnalyzer {
    capability_re: Option<Regex>,
}

impl CodeAnalyzer {
    /// Build an analyzer that also treats calls to any capability in
    /// `capabilities` as async, since every host call returns a promise.
    pub fn new(capabilities: &CapabilitySet) -> Self {
        let names: Vec<String> = capabilities
            .iter()
            .map(|c| regex::escape(&c.name))
            .collect();
        let capability_re = if names.is_empty() {
            None
        } else {
            let pattern = format!(r"(^|[^\w$.])({})\s*[.(]", names.join("|"));
            match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(error = %e, "capability pattern rejected, host calls not classified");
                    None
                }
            }
        };
        Self { capability_re }
    }

    /// Classify `code`.
    pub fn analyze(&self, code: &str) -> CodeFeatures {
        if FORCE_ASYNC_RE.is_match(&lexer::comments(code)) {
            return CodeFeatures::asynchronous("force_async_marker");
        }

        let stripped = lexer::strip(code);
        for (name, re) in CODE_PATTERNS.iter() {
            if re.is_match(&stripped) {
                return CodeFeatures::asynchronous(name);
            }
        }

        if let Some(re) = &self.capability_re {
            if re.is_match(&stripped) {
                return CodeFeatures::asynchronous("host_capability_call");
            }
        }

        CodeFeatures::sync()
    }
}

/// Quick substring scan for async markers without lexing.
///
/// Occurrences inside strings and comments count, so this can report async
/// for sync code but never the reverse.
pub fn is_likely_async(code: &str) -> bool {
    ASYNC_HINTS.iter().any(|hint| code.contains(hint))
}
