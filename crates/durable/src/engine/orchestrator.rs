//! Action execution orchestrator
//!
//! The orchestrator is the single place that decides a failure is terminal.
//! It resolves the action, runs the retry ladder inside the action's circuit
//! breaker, logs the outcome and escalates rule-driven failures to the DLQ.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::action::{ActionContext, ActionExecutionResult, ActionFailure, ActionRegistry};
use crate::error::WorkflowError;
use crate::logging::{ErrorLogger, LogCategory, LogEntry};
use crate::persistence::{DeadLetterStore, DlqItem};
use crate::reliability::{CircuitBreakerError, CircuitBreakerRegistry, Retrier, RetryObserver, RetryPolicy};
use crate::rule::{Parameters, Rule};

/// Per-call execution options
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOptions {
    /// Retries after the initial attempt
    pub max_retries: u32,

    /// Replay of a dead-lettered invocation; never enqueues a new DLQ item
    pub is_retry: bool,

    /// Replay context stored with a DLQ item, e.g. the trigger payload
    pub context: Parameters,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            is_retry: false,
            context: Parameters::new(),
        }
    }
}

impl ExecuteOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_context(mut self, context: Parameters) -> Self {
        self.context = context;
        self
    }

    /// Options for reprocessing a DLQ item: one extra attempt, no re-enqueue
    pub fn dlq_retry(context: Parameters) -> Self {
        Self {
            max_retries: 1,
            is_retry: true,
            context,
        }
    }
}

/// Terminal failure with the id of its persisted error record
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub error: WorkflowError,
    pub error_id: Uuid,
    /// Set when the failure was escalated to the dead letter queue
    pub dlq_item_id: Option<Uuid>,
}

impl ExecutionFailure {
    /// The error with its `(Error ID: ..)` suffix, as shown to callers
    pub fn into_error(self) -> WorkflowError {
        self.error.with_error_id(self.error_id)
    }
}

/// Runs actions with retries, circuit breaking and DLQ escalation
pub struct ActionOrchestrator {
    actions: Arc<ActionRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<dyn DeadLetterStore>,
    logger: ErrorLogger,
    retry_policy: RetryPolicy,
}

impl ActionOrchestrator {
    pub fn new(
        actions: Arc<ActionRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        dlq: Arc<dyn DeadLetterStore>,
        logger: ErrorLogger,
    ) -> Self {
        Self {
            actions,
            breakers,
            dlq,
            logger,
            retry_policy: RetryPolicy::exponential(),
        }
    }

    /// Backoff settings; per-call `max_retries` comes from [`ExecuteOptions`]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Options for a first, rule-driven execution under the configured policy
    pub fn default_options(&self) -> ExecuteOptions {
        ExecuteOptions::default().with_max_retries(self.retry_policy.max_retries)
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn logger(&self) -> &ErrorLogger {
        &self.logger
    }

    /// Execute an action, failing with an `ActionError` suffixed by its error id
    ///
    /// A `rule` marks the call as rule-driven: only then does a terminal
    /// failure create a DLQ item (and never when `options.is_retry` is set).
    pub async fn execute_action_safely(
        &self,
        action_id: &str,
        parameters: &Parameters,
        rule: Option<&Rule>,
        options: ExecuteOptions,
    ) -> Result<ActionExecutionResult, WorkflowError> {
        self.execute_action(action_id, parameters, rule, options)
            .await
            .map_err(ExecutionFailure::into_error)
    }

    /// Like [`execute_action_safely`](Self::execute_action_safely) but keeps
    /// the error id separate from the error
    #[instrument(
        skip(self, parameters, rule, options),
        fields(rule_id = rule.map(|r| r.id.as_str()), is_retry = options.is_retry)
    )]
    pub async fn execute_action(
        &self,
        action_id: &str,
        parameters: &Parameters,
        rule: Option<&Rule>,
        options: ExecuteOptions,
    ) -> Result<ActionExecutionResult, ExecutionFailure> {
        let Some(handler) = self.actions.get(action_id) else {
            let error = WorkflowError::action(
                action_id,
                json!(parameters),
                format!("Action not found: {}", action_id),
            );
            let error_id = self
                .logger
                .log_error(
                    &error,
                    "execute_action",
                    json!({ "rule_id": rule.map(|r| &r.id) }),
                )
                .await;
            return Err(ExecutionFailure {
                error,
                error_id,
                dlq_item_id: None,
            });
        };

        let breaker = self.breakers.get_or_create(&format!("action:{}", action_id));
        let policy = self.retry_policy.clone().with_max_retries(options.max_retries);
        let observer = RetryLogger {
            logger: &self.logger,
            action_id,
            rule_id: rule.map(|r| r.id.as_str()),
            max_attempts: policy.max_attempts(),
        };

        let started = Instant::now();
        let outcome = breaker
            .execute(|| async {
                Retrier::new(policy)
                    .retry_if(ActionFailure::is_transient)
                    .on_retry(&observer)
                    .run(|attempt| {
                        let handler = handler.clone();
                        let ctx = ActionContext {
                            action_id: action_id.to_string(),
                            rule_id: rule.map(|r| r.id.clone()),
                            attempt: attempt + 1,
                            is_retry: options.is_retry,
                            context: options.context.clone(),
                        };
                        async move {
                            handler
                                .execute(&ctx, parameters)
                                .await
                                .map(|result| (result, ctx.attempt))
                        }
                    })
                    .await
            })
            .await;

        match outcome {
            Ok((result, attempt)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(action_id, attempt, duration_ms, "action executed");

                let mut entry = LogEntry::info(
                    LogCategory::Execution,
                    format!("Action '{}' executed successfully", action_id),
                )
                .with_action(action_id)
                .with_details(json!({
                    "duration_ms": duration_ms,
                    "attempt": attempt,
                    "is_retry": options.is_retry,
                    "message": result.message,
                }));
                if let Some(rule) = rule {
                    entry = entry.with_rule(&rule.id).with_trigger(&rule.trigger_id);
                }
                self.logger.record(entry).await;

                Ok(result)
            }
            Err(err) => {
                self.handle_exhaustion(action_id, parameters, rule, &options, err)
                    .await
            }
        }
    }

    async fn handle_exhaustion(
        &self,
        action_id: &str,
        parameters: &Parameters,
        rule: Option<&Rule>,
        options: &ExecuteOptions,
        err: CircuitBreakerError<ActionFailure>,
    ) -> Result<ActionExecutionResult, ExecutionFailure> {
        let (message, failure_details) = match &err {
            CircuitBreakerError::Open { name } => (
                format!(
                    "Action '{}' rejected: circuit breaker '{}' is open",
                    action_id, name
                ),
                json!({ "circuit_open": true }),
            ),
            CircuitBreakerError::Inner(failure) => (
                format!("Action '{}' failed: {}", action_id, failure.message),
                json!({
                    "circuit_open": false,
                    "error_type": failure.error_type,
                    "retryable": failure.retryable,
                    "failure_details": failure.details,
                }),
            ),
        };
        warn!(action_id, error = %message, "action failed terminally");

        let error = WorkflowError::action(action_id, json!(parameters), message);
        let mut details = json!({
            "rule_id": rule.map(|r| &r.id),
            "max_retries": options.max_retries,
            "is_retry": options.is_retry,
        });
        if let (Some(map), serde_json::Value::Object(extra)) = (details.as_object_mut(), failure_details) {
            map.extend(extra);
        }
        let error_id = self
            .logger
            .log_error(&error, "execute_action_safely", details)
            .await;

        let mut dlq_item_id = None;
        if let Some(rule) = rule.filter(|_| !options.is_retry) {
            let item = DlqItem::from_failure(
                rule,
                error.clone().with_error_id(error_id).to_string(),
                Some(format!("{:?}", err)),
                options.context.clone(),
            );
            match self.dlq.enqueue_dlq_item(item).await {
                Ok(item) => {
                    debug!(dlq_id = %item.id, rule_id = %rule.id, "added to dead letter queue");
                    self.logger
                        .record(
                            LogEntry::warn(
                                LogCategory::Dlq,
                                format!("Action '{}' added to dead letter queue", action_id),
                            )
                            .with_rule(&rule.id)
                            .with_trigger(&rule.trigger_id)
                            .with_action(action_id)
                            .with_details(json!({ "dlq_id": item.id, "error_id": error_id })),
                        )
                        .await;
                    dlq_item_id = Some(item.id);
                }
                Err(e) => {
                    let dlq_error = WorkflowError::database(
                        format!("Failed to add action '{}' to dead letter queue", action_id),
                        Some(e.to_string()),
                    );
                    self.logger
                        .log_error(
                            &dlq_error,
                            "dead_letter_queue",
                            json!({ "rule_id": rule.id, "original_error_id": error_id }),
                        )
                        .await;
                }
            }
        }

        Err(ExecutionFailure {
            error,
            error_id,
            dlq_item_id,
        })
    }
}

struct RetryLogger<'a> {
    logger: &'a ErrorLogger,
    action_id: &'a str,
    rule_id: Option<&'a str>,
    max_attempts: u32,
}

#[async_trait]
impl RetryObserver<ActionFailure> for RetryLogger<'_> {
    async fn on_retry(&self, error: &ActionFailure, attempt: u32, delay: Duration) {
        warn!(
            action_id = self.action_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "action attempt failed, retrying"
        );

        let mut entry = LogEntry::warn(
            LogCategory::Retry,
            format!(
                "Retrying action '{}' after attempt {}/{}",
                self.action_id, attempt, self.max_attempts
            ),
        )
        .with_action(self.action_id)
        .with_details(json!({
            "attempt": attempt,
            "delay_ms": delay.as_millis() as u64,
            "error": error.message,
        }));
        if let Some(rule_id) = self.rule_id {
            entry = entry.with_rule(rule_id);
        }
        self.logger.record(entry).await;
    }
}
