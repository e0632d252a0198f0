//! Validation, classification and wrapping of user code, with caching.
//!
//! A [`CompiledProgram`] is the user snippet wrapped in the function shape
//! its execution path expects, checked by `oxc_parser` so syntax errors are
//! reported before an admission slot or runtime is spent. Programs and
//! validation verdicts are cached in [`ShardedLru`]s keyed by the SHA-256
//! of the source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use oxc_allocator::Allocator;
use oxc_parser::Parser;
use oxc_span::SourceType;

use crate::analyzer::{CodeAnalyzer, CodeFeatures, Strategy};
use crate::cache::{cache_key, CacheKey, CacheStats, ShardedLru};
use crate::error::ExecutionError;
use crate::validator::SecurityValidator;

/// A parsed, wrapped program ready to run on either path.
#[derive(Debug)]
pub struct CompiledProgram {
    /// Cache key (SHA-256 of the user source).
    pub key: CacheKey,
    /// Hex form of `key`, for logs and audit records.
    pub code_hash: String,
    /// Classification of the source.
    pub features: CodeFeatures,
    /// Script handed to `execute_script`.
    pub script: Arc<str>,
}

impl CompiledProgram {
    /// Execution path this program takes.
    pub fn strategy(&self) -> Strategy {
        self.features.strategy
    }
}

/// Wrap user code for the given path.
///
/// The pool path calls a plain function so synchronous code completes
/// within `execute_script`; the event-loop path calls an async function so
/// returned promises are awaited and rejections land in the same handler
/// as synchronous throws.
fn wrap(code: &str, strategy: Strategy) -> String {
    match strategy {
        Strategy::Pool => {
            format!("__runbox.runSync(function (input, executionId) {{\n{code}\n}});")
        }
        Strategy::EventLoop => {
            format!("__runbox.runAsync(async function (input, executionId) {{\n{code}\n}});")
        }
    }
}

/// Parse `script` and make sure it is a single wrapper statement.
fn check_syntax(script: &str) -> Result<(), ExecutionError> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, script, SourceType::cjs()).parse();

    if ret.panicked {
        return Err(ExecutionError::SyntaxError {
            message: "parser could not recover from malformed input".into(),
        });
    }
    if let Some(first) = ret.errors.first() {
        let extra = ret.errors.len() - 1;
        let message = if extra == 0 {
            first.to_string()
        } else {
            format!("{first} (and {extra} more)")
        };
        return Err(ExecutionError::SyntaxError { message });
    }
    if ret.program.body.len() != 1 {
        return Err(ExecutionError::SyntaxError {
            message: "unbalanced braces: code closes its enclosing function".into(),
        });
    }
    Ok(())
}

/// Owns the validator, the analyzer and both caches.
pub struct Compiler {
    validator: SecurityValidator,
    analyzer: CodeAnalyzer,
    programs: ShardedLru<Arc<CompiledProgram>>,
    verdicts: ShardedLru<Result<(), ExecutionError>>,
    compilations: AtomicU64,
}

impl Compiler {
    /// Create a compiler with caches of the given sizes.
    pub fn new(
        validator: SecurityValidator,
        analyzer: CodeAnalyzer,
        compiled_capacity: usize,
        validation_capacity: usize,
        shards: usize,
    ) -> Self {
        Self {
            validator,
            analyzer,
            programs: ShardedLru::new(compiled_capacity, shards),
            verdicts: ShardedLru::new(validation_capacity, shards),
            compilations: AtomicU64::new(0),
        }
    }

    /// The validator, for transport decoding.
    pub fn validator(&self) -> &SecurityValidator {
        &self.validator
    }

    /// Validate `code`, consulting the validation cache first.
    ///
    /// The size check always runs uncached so oversized input is never hashed.
    pub fn validate(&self, code: &str) -> Result<(), ExecutionError> {
        let max = self.validator.max_code_length();
        if code.len() > max {
            return Err(ExecutionError::CodeTooLarge {
                max,
                actual: code.len(),
            });
        }
        let key = cache_key(code);
        if let Some(verdict) = self.verdicts.get(&key) {
            return verdict;
        }
        let verdict = self.validator.validate(code);
        self.verdicts.insert(key, verdict.clone())
    }

    /// Classify, wrap and syntax-check `code`, consulting the compiled cache.
    ///
    /// Only successful compilations are cached.
    pub fn compile(&self, code: &str) -> Result<Arc<CompiledProgram>, ExecutionError> {
        let key = cache_key(code);
        self.programs.get_or_try_insert_with(key, || {
            self.compilations.fetch_add(1, Ordering::Relaxed);
            let features = self.analyzer.analyze(code);
            let script = wrap(code, features.strategy);
            check_syntax(&script)?;
            tracing::debug!(
                strategy = features.strategy.as_str(),
                reason = features.reason.unwrap_or("none"),
                "compiled program"
            );
            Ok(Arc::new(CompiledProgram {
                key,
                code_hash: hex::encode(key),
                features,
                script: script.into(),
            }))
        })
    }

    /// Compiled-code cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.programs.stats()
    }

    /// Validation cache counters.
    pub fn validation_cache_stats(&self) -> CacheStats {
        self.verdicts.stats()
    }

    /// Number of times the compile step actually ran.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }
}
