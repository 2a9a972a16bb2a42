//! Triggerflow worker process
//!
//! Wires a store, the built-in actions and the configured triggers into an
//! [`Engine`](triggerflow_durable::Engine) and runs its background jobs.

pub mod bootstrap;
pub mod telemetry;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use triggerflow_durable::EngineConfig;

pub use bootstrap::Bootstrap;
pub use telemetry::init_tracing;

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string; the in-memory store is used when unset
    pub database_url: Option<String>,

    /// JSON file with triggers and seed rules
    pub bootstrap_file: Option<PathBuf>,

    /// How long to wait for background jobs on shutdown
    pub shutdown_timeout: Duration,

    pub engine: EngineConfig,
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string (optional)
    /// - `TRIGGERFLOW_BOOTSTRAP_FILE`: triggers and rules to load at startup (optional)
    /// - `TRIGGERFLOW_SHUTDOWN_TIMEOUT_SECS`: default 30
    /// - `TRIGGERFLOW_*`: engine settings, see [`EngineConfig::from_env`]
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        let bootstrap_file = std::env::var("TRIGGERFLOW_BOOTSTRAP_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let shutdown_timeout = match std::env::var("TRIGGERFLOW_SHUTDOWN_TIMEOUT_SECS") {
            Ok(v) => Duration::from_secs(
                v.trim()
                    .parse()
                    .with_context(|| format!("invalid TRIGGERFLOW_SHUTDOWN_TIMEOUT_SECS: {:?}", v))?,
            ),
            Err(_) => Duration::from_secs(30),
        };

        let engine = EngineConfig::from_env().context("invalid engine configuration")?;

        Ok(Self {
            database_url,
            bootstrap_file,
            shutdown_timeout,
            engine,
        })
    }
}
