#![warn(missing_docs)]

//! # runbox-config
//!
//! Configuration loading for the runbox execution service.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every value is optional; absent values fall back to the engine defaults.
//!
//! ## Example
//!
//! ```toml
//! [engine]
//! execution_timeout_ms = 5000
//! max_code_length = 65536
//! max_concurrent = 32
//!
//! [pool]
//! min_size = 2
//! max_size = 8
//! idle_timeout_secs = 60
//!
//! [breaker]
//! min_requests = 20
//! failure_ratio = 0.5
//! open_timeout_secs = 30
//!
//! [cache]
//! compiled_capacity = 1024
//! shards = 16
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable that points at the config file.
pub const CONFIG_ENV_VAR: &str = "RUNBOX_CONFIG";

/// Config file looked up in the working directory when the env var is unset.
pub const DEFAULT_CONFIG_FILE: &str = "runbox.toml";

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level runbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunboxConfig {
    /// Execution limits and admission settings.
    #[serde(default)]
    pub engine: EngineOverrides,

    /// Runtime pool sizing.
    #[serde(default)]
    pub pool: PoolOverrides,

    /// Circuit breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerOverrides,

    /// Compiled-code and validation cache sizing.
    #[serde(default)]
    pub cache: CacheOverrides,

    /// Sandbox global surface.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

/// Execution limit overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineOverrides {
    /// Hard wall-clock deadline per execution, in milliseconds.
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,

    /// Maximum code length in bytes.
    #[serde(default)]
    pub max_code_length: Option<usize>,

    /// Maximum serialized input size in kilobytes.
    #[serde(default)]
    pub max_input_kb: Option<usize>,

    /// Maximum serialized result size in kilobytes.
    #[serde(default)]
    pub max_result_kb: Option<usize>,

    /// V8 heap limit per runtime in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent executions (admission semaphore size).
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// How long a request may wait for an admission slot, in milliseconds.
    #[serde(default)]
    pub concurrency_wait_ms: Option<u64>,

    /// Maximum host capability calls per execution.
    #[serde(default)]
    pub max_host_calls: Option<usize>,
}

/// Runtime pool overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolOverrides {
    /// Runtimes kept warm at all times.
    #[serde(default)]
    pub min_size: Option<usize>,

    /// Upper bound the pool may grow to under contention.
    #[serde(default)]
    pub max_size: Option<usize>,

    /// Idle runtimes above `min_size` are evicted after this many seconds.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// How long an execution may wait for a free runtime, in milliseconds.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    /// Retire a runtime after this many executions.
    #[serde(default)]
    pub max_uses: Option<u32>,
}

/// Circuit breaker overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerOverrides {
    /// Minimum samples in the rolling window before the breaker may trip.
    #[serde(default)]
    pub min_requests: Option<u32>,

    /// Failure ratio (0.0, 1.0] at which the breaker trips.
    #[serde(default)]
    pub failure_ratio: Option<f64>,

    /// Rolling window length in seconds.
    #[serde(default)]
    pub interval_secs: Option<u64>,

    /// How long the breaker stays open, in seconds.
    #[serde(default)]
    pub open_timeout_secs: Option<u64>,

    /// Trial requests allowed while half-open.
    #[serde(default)]
    pub half_open_max_requests: Option<u32>,
}

/// Cache overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheOverrides {
    /// Total compiled programs kept across all shards.
    #[serde(default)]
    pub compiled_capacity: Option<usize>,

    /// Total validation verdicts kept across all shards.
    #[serde(default)]
    pub validation_capacity: Option<usize>,

    /// Number of shards per cache.
    #[serde(default)]
    pub shards: Option<usize>,
}

/// Sandbox global surface overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Extra globals to delete on top of the built-in deny list.
    #[serde(default)]
    pub disabled_globals: Vec<String>,
}

impl RunboxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: RunboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(min), Some(max)) = (self.pool.min_size, self.pool.max_size) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "pool.min_size ({min}) must not exceed pool.max_size ({max})"
                )));
            }
        }
        if self.pool.max_size == Some(0) {
            return Err(ConfigError::Invalid(
                "pool.max_size must be at least 1".into(),
            ));
        }
        if let Some(ratio) = self.breaker.failure_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "breaker.failure_ratio must be in (0.0, 1.0], got {ratio}"
                )));
            }
        }
        if self.breaker.half_open_max_requests == Some(0) {
            return Err(ConfigError::Invalid(
                "breaker.half_open_max_requests must be at least 1".into(),
            ));
        }
        if self.cache.shards == Some(0) {
            return Err(ConfigError::Invalid("cache.shards must be at least 1".into()));
        }
        if self.engine.execution_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "engine.execution_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `RUNBOX_CONFIG` environment variable
/// 2. `./runbox.toml` in the current directory
/// 3. None (no config file found, not an error)
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from(DEFAULT_CONFIG_FILE);
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders are kept verbatim.
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
