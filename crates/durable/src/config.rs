// Engine configuration
//
// Loaded from TRIGGERFLOW_* environment variables. Unset variables keep their
// defaults; set-but-invalid values are rejected.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::SchedulerConfig;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use crate::worker::DlqSweeperConfig;

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for every engine component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dlq: DlqSweeperConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TRIGGERFLOW_MAX_RETRIES` (3)
    /// - `TRIGGERFLOW_RETRY_BASE_DELAY_MS` (1000)
    /// - `TRIGGERFLOW_RETRY_BACKOFF_MULTIPLIER` (2.0)
    /// - `TRIGGERFLOW_RETRY_MAX_DELAY_MS` (60000)
    /// - `TRIGGERFLOW_BREAKER_FAILURE_THRESHOLD` (5)
    /// - `TRIGGERFLOW_BREAKER_RESET_TIMEOUT_MS` (60000)
    /// - `TRIGGERFLOW_DLQ_BATCH_SIZE` (10)
    /// - `TRIGGERFLOW_DLQ_MAX_RETRY_ATTEMPTS` (3)
    /// - `TRIGGERFLOW_DLQ_SWEEP_INTERVAL_SECS` (300)
    /// - `TRIGGERFLOW_DLQ_OLDER_THAN_MINUTES` (unset)
    /// - `TRIGGERFLOW_DLQ_STALE_CLAIM_SECS` (900)
    /// - `TRIGGERFLOW_SCHEDULER_POLL_INTERVAL_SECS` (30)
    /// - `TRIGGERFLOW_SCHEDULER_TIMER_HORIZON_SECS` (3600)
    /// - `TRIGGERFLOW_SCHEDULER_BATCH_SIZE` (50)
    /// - `TRIGGERFLOW_SCHEDULER_STALE_CLAIM_SECS` (900)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut config = Self::default();

        if let Some(n) = vars.parse("TRIGGERFLOW_MAX_RETRIES")? {
            config.retry.max_retries = n;
        }
        if let Some(ms) = vars.parse("TRIGGERFLOW_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(m) = vars.parse::<f64>("TRIGGERFLOW_RETRY_BACKOFF_MULTIPLIER")? {
            if !m.is_finite() || m < 1.0 {
                return Err(vars.invalid(
                    "TRIGGERFLOW_RETRY_BACKOFF_MULTIPLIER",
                    "must be a number >= 1",
                ));
            }
            config.retry.backoff_multiplier = m;
        }
        if let Some(ms) = vars.parse("TRIGGERFLOW_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }

        if let Some(n) = vars.parse_positive("TRIGGERFLOW_BREAKER_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = n;
        }
        if let Some(ms) = vars.parse("TRIGGERFLOW_BREAKER_RESET_TIMEOUT_MS")? {
            config.circuit_breaker.reset_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = vars.parse_positive("TRIGGERFLOW_DLQ_BATCH_SIZE")? {
            config.dlq.batch_size = n;
        }
        if let Some(n) = vars.parse_positive("TRIGGERFLOW_DLQ_MAX_RETRY_ATTEMPTS")? {
            config.dlq.max_retry_attempts = n;
        }
        if let Some(secs) = vars.parse_positive("TRIGGERFLOW_DLQ_SWEEP_INTERVAL_SECS")? {
            config.dlq.interval = Duration::from_secs(u64::from(secs));
        }
        if let Some(minutes) = vars.parse("TRIGGERFLOW_DLQ_OLDER_THAN_MINUTES")? {
            config.dlq.older_than_minutes = Some(minutes);
        }
        if let Some(secs) = vars.parse_positive("TRIGGERFLOW_DLQ_STALE_CLAIM_SECS")? {
            config.dlq.stale_claim_threshold = Duration::from_secs(u64::from(secs));
        }

        if let Some(secs) = vars.parse_positive("TRIGGERFLOW_SCHEDULER_POLL_INTERVAL_SECS")? {
            config.scheduler.poll_interval = Duration::from_secs(u64::from(secs));
        }
        if let Some(secs) = vars.parse("TRIGGERFLOW_SCHEDULER_TIMER_HORIZON_SECS")? {
            config.scheduler.timer_horizon = Duration::from_secs(secs);
        }
        if let Some(n) = vars.parse_positive("TRIGGERFLOW_SCHEDULER_BATCH_SIZE")? {
            config.scheduler.batch_size = n;
        }
        if let Some(secs) = vars.parse_positive("TRIGGERFLOW_SCHEDULER_STALE_CLAIM_SECS")? {
            config.scheduler.stale_claim_threshold = Duration::from_secs(u64::from(secs));
        }

        Ok(config)
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(var) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    var,
                    value,
                    reason: e.to_string(),
                }),
        }
    }

    fn parse_positive(&self, var: &'static str) -> Result<Option<u32>, ConfigError> {
        match self.parse::<u32>(var)? {
            Some(0) => Err(self.invalid(var, "must be greater than zero")),
            other => Ok(other),
        }
    }

    fn invalid(&self, var: &'static str, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            var,
            value: self.raw(var).unwrap_or_default(),
            reason: reason.to_string(),
        }
    }
}
