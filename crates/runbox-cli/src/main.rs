#![warn(missing_docs)]

//! runbox: run one JavaScript snippet in the sandbox and print the result.
//!
//! ```text
//! runbox <file|-> [--input <json>] [--config <path>]
//! ```
//!
//! The result is written to stdout as JSON. Failures are written as a
//! structured error object and the process exits with status 1.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use runbox_config::RunboxConfig;
use runbox_engine::audit::TracingAuditLogger;
use runbox_engine::{CapabilitySet, Engine, EngineConfig, ExecutionContext};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "runbox", version, about = "Run a JavaScript snippet in the runbox sandbox")]
struct Cli {
    #[clap(help = "Script file to run, or - to read from stdin")]
    source: String,

    #[clap(
        long,
        short,
        default_value = "null",
        value_parser = parse_input,
        help = "JSON value bound to `input`"
    )]
    input: serde_json::Value,

    #[clap(long, short, help = "Config file; searched for when omitted")]
    config: Option<PathBuf>,
}

fn parse_input(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Build an EngineConfig from config overrides.
fn build_engine_config(config: &RunboxConfig) -> EngineConfig {
    let mut engine = EngineConfig::default();

    let o = &config.engine;
    if let Some(ms) = o.execution_timeout_ms {
        engine.execution_timeout = Duration::from_millis(ms);
    }
    if let Some(len) = o.max_code_length {
        engine.max_code_length = len;
    }
    if let Some(kb) = o.max_input_kb {
        engine.max_input_size = kb * 1024;
    }
    if let Some(kb) = o.max_result_kb {
        engine.max_result_size = kb * 1024;
    }
    if let Some(mb) = o.max_heap_mb {
        engine.max_heap_size = mb * 1024 * 1024;
    }
    if let Some(n) = o.max_concurrent {
        engine.max_concurrent = n;
    }
    if let Some(ms) = o.concurrency_wait_ms {
        engine.concurrency_wait = Duration::from_millis(ms);
    }
    if let Some(n) = o.max_host_calls {
        engine.max_host_calls = n;
    }

    let p = &config.pool;
    if let Some(n) = p.min_size {
        engine.pool.min_size = n;
    }
    if let Some(n) = p.max_size {
        engine.pool.max_size = n;
    }
    if let Some(secs) = p.idle_timeout_secs {
        engine.pool.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = p.acquire_timeout_ms {
        engine.pool.acquire_timeout = Duration::from_millis(ms);
    }
    if let Some(uses) = p.max_uses {
        // 0 disables retirement
        engine.pool.max_uses = (uses > 0).then_some(uses);
    }

    let b = &config.breaker;
    if let Some(n) = b.min_requests {
        engine.breaker.min_requests = n;
    }
    if let Some(ratio) = b.failure_ratio {
        engine.breaker.failure_ratio = ratio;
    }
    if let Some(secs) = b.interval_secs {
        engine.breaker.interval = Duration::from_secs(secs);
    }
    if let Some(secs) = b.open_timeout_secs {
        engine.breaker.open_timeout = Duration::from_secs(secs);
    }
    if let Some(n) = b.half_open_max_requests {
        engine.breaker.half_open_max_requests = n;
    }

    let c = &config.cache;
    if let Some(n) = c.compiled_capacity {
        engine.cache.compiled_capacity = n;
    }
    if let Some(n) = c.validation_capacity {
        engine.cache.validation_capacity = n;
    }
    if let Some(n) = c.shards {
        engine.cache.shards = n;
    }

    engine.disabled_globals = config.sandbox.disabled_globals.clone();
    engine
}

fn load_config(explicit: Option<PathBuf>) -> Result<RunboxConfig> {
    match explicit.or_else(runbox_config::find_config_file) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            RunboxConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(RunboxConfig::default())
        }
    }
}

fn read_source(source: &str) -> Result<String> {
    if source == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("failed to read code from stdin")?;
        Ok(code)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("failed to read {source}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config)?;
    let code = read_source(&cli.source)?;

    let mut engine_config = build_engine_config(&config);
    // One snippet needs one runtime.
    engine_config.pool.min_size = engine_config.pool.min_size.min(1);

    let engine = Engine::with_audit_logger(
        engine_config,
        CapabilitySet::default(),
        None,
        std::sync::Arc::new(TracingAuditLogger),
    )
    .await
    .context("failed to start engine")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling execution");
            ctrl_c.cancel();
        }
    });

    let ctx = ExecutionContext::new().with_cancellation(cancel);
    let outcome = engine.execute(ctx, &code, cli.input).await;
    engine.shutdown();

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.to_structured_error())?);
            std::process::exit(1);
        }
    }
}
