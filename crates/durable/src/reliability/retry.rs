//! Retry policy and executor

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::duration_millis;

/// Configuration for action retries
///
/// An operation is attempted up to `max_retries + 1` times. The wait before
/// retry `n` (0-based) is `base_delay * backoff_multiplier^n`, capped at
/// `max_delay`.
///
/// # Example
///
/// ```
/// use triggerflow_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(3)
///     .with_base_delay(Duration::from_secs(1));
///
/// // First retry after 1 second
/// // Second retry after 2 seconds
/// // Third retry after 4 seconds
/// assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness. Off by default so the
    /// schedule is exactly 1s, 2s, 4s, ...
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with the engine defaults
    ///
    /// - 3 retries (4 attempts total)
    /// - 1 second base delay
    /// - 2x multiplier
    /// - 60 second cap
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the failed attempt with 0-based index `attempt`
    pub fn delay_for_retry(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Total attempts including the initial one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Hook invoked before each backoff sleep
///
/// `attempt` is the 1-based number of the attempt that just failed.
#[async_trait]
pub trait RetryObserver<E: Send + Sync>: Send + Sync {
    async fn on_retry(&self, error: &E, attempt: u32, delay: Duration);
}

type RetryCondition<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;

/// Runs an operation under a [`RetryPolicy`]
///
/// ```ignore
/// let result = Retrier::new(policy)
///     .retry_if(|e: &ActionFailure| e.retryable)
///     .on_retry(&observer)
///     .run(|attempt| handler.execute(attempt))
///     .await;
/// ```
pub struct Retrier<'a, E> {
    policy: RetryPolicy,
    retry_condition: Option<RetryCondition<'a, E>>,
    observer: Option<&'a dyn RetryObserver<E>>,
}

impl<'a, E: Send + Sync> Retrier<'a, E> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_condition: None,
            observer: None,
        }
    }

    /// Only retry errors for which `condition` returns true (default: all)
    pub fn retry_if(mut self, condition: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.retry_condition = Some(Box::new(condition));
        self
    }

    pub fn on_retry(mut self, observer: &'a dyn RetryObserver<E>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, passing it the 0-based attempt index
    ///
    /// Returns the first success verbatim. The last error is returned once
    /// retries are exhausted or the retry condition refuses the error.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= self.policy.max_retries || !self.should_retry(&error) {
                return Err(error);
            }

            let delay = self.policy.delay_for_retry(attempt);
            if let Some(observer) = self.observer {
                observer.on_retry(&error, attempt + 1, delay).await;
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn should_retry(&self, error: &E) -> bool {
        self.retry_condition
            .as_ref()
            .map(|condition| condition(error))
            .unwrap_or(true)
    }
}

/// Retry `operation` under `policy`, retrying every error
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    E: Send + Sync,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    Retrier::new(policy.clone()).run(operation).await
}
