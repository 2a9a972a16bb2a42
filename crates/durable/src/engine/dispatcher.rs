//! Trigger dispatch
//!
//! Matching rules run one after another in store order. A failing rule never
//! stops the rules after it. Delayed rules are handed to the
//! [`DelayedActionScheduler`] and do not hold up the dispatch call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::orchestrator::ActionOrchestrator;
use super::scheduler::DelayedActionScheduler;
use super::trigger_context;
use crate::action::{ActionExecutionResult, TriggerRegistry};
use crate::error::WorkflowError;
use crate::logging::{ErrorLogger, LogCategory, LogEntry};
use crate::persistence::RuleStore;
use crate::rule::{Parameters, Rule, RuleRef, Schedule};

/// What happened to one matched rule
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RuleOutcome {
    /// Immediate rule whose action succeeded
    Executed { result: ActionExecutionResult },

    /// Immediate rule whose action failed terminally, or a delayed rule that
    /// could not be scheduled
    Failed { error: WorkflowError },

    /// Delayed rule persisted for later execution
    Scheduled { job_id: Uuid, run_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchedRule {
    pub rule: RuleRef,
    pub outcome: RuleOutcome,
}

/// Result of [`TriggerDispatcher::dispatch`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchResult {
    /// Enabled rules for the trigger whose conditions held
    pub rules_matched: u32,
    pub executed_rules: Vec<DispatchedRule>,
}

impl DispatchResult {
    pub fn failed(&self) -> impl Iterator<Item = &DispatchedRule> {
        self.executed_rules
            .iter()
            .filter(|r| matches!(r.outcome, RuleOutcome::Failed { .. }))
    }
}

/// Entry point for trigger events
pub struct TriggerDispatcher {
    triggers: Arc<TriggerRegistry>,
    rules: Arc<dyn RuleStore>,
    orchestrator: Arc<ActionOrchestrator>,
    scheduler: DelayedActionScheduler,
    logger: ErrorLogger,
}

impl TriggerDispatcher {
    pub fn new(
        triggers: Arc<TriggerRegistry>,
        rules: Arc<dyn RuleStore>,
        orchestrator: Arc<ActionOrchestrator>,
        scheduler: DelayedActionScheduler,
        logger: ErrorLogger,
    ) -> Self {
        Self {
            triggers,
            rules,
            orchestrator,
            scheduler,
            logger,
        }
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    /// Evaluate and run every enabled rule bound to `trigger_id`
    ///
    /// Fails with a `TriggerError` for unknown triggers and a
    /// `DatabaseError` when rules cannot be loaded. Per-rule failures are
    /// reported in the result instead.
    #[instrument(skip(self, parameters))]
    pub async fn dispatch(
        &self,
        trigger_id: &str,
        parameters: Parameters,
    ) -> Result<DispatchResult, WorkflowError> {
        if !self.triggers.contains(trigger_id) {
            let error = WorkflowError::trigger(trigger_id, format!("Unknown trigger: {}", trigger_id));
            let error_id = self
                .logger
                .log_error(&error, "dispatch_trigger", json!({ "parameters": parameters }))
                .await;
            return Err(error.with_error_id(error_id));
        }

        let candidates = match self.rules.enabled_rules_for_trigger(trigger_id).await {
            Ok(rules) => rules,
            Err(e) => {
                let error: WorkflowError = e.into();
                let error_id = self
                    .logger
                    .log_error(&error, "dispatch_trigger", json!({ "trigger_id": trigger_id }))
                    .await;
                return Err(error.with_error_id(error_id));
            }
        };
        debug!(candidates = candidates.len(), "loaded rules");

        let mut result = DispatchResult::default();
        for rule in candidates.iter().filter(|r| r.enabled) {
            if !self.evaluate(trigger_id, rule, &parameters).await {
                continue;
            }
            result.rules_matched += 1;

            let outcome = match rule.schedule {
                Schedule::Immediate => self.run_immediate(trigger_id, rule, &parameters).await,
                Schedule::Delayed => match self.scheduler.schedule(rule, parameters.clone()).await {
                    Ok(job) => RuleOutcome::Scheduled {
                        job_id: job.id,
                        run_at: job.run_at,
                    },
                    Err(error) => RuleOutcome::Failed { error },
                },
            };

            result.executed_rules.push(DispatchedRule {
                rule: rule.reference(),
                outcome,
            });
        }

        info!(
            rules_matched = result.rules_matched,
            failed = result.failed().count(),
            "trigger dispatched"
        );
        self.logger
            .record(
                LogEntry::info(
                    LogCategory::Dispatch,
                    format!("Trigger '{}' dispatched", trigger_id),
                )
                .with_trigger(trigger_id)
                .with_details(json!({
                    "rules_considered": candidates.len(),
                    "rules_matched": result.rules_matched,
                    "executed_rules": result
                        .executed_rules
                        .iter()
                        .map(|r| &r.rule.id)
                        .collect::<Vec<_>>(),
                })),
            )
            .await;

        Ok(result)
    }

    /// Whether `rule` matches; skips and evaluation errors are logged
    async fn evaluate(&self, trigger_id: &str, rule: &Rule, parameters: &Parameters) -> bool {
        match rule.matches(parameters) {
            Ok(true) => {
                self.logger
                    .record(
                        LogEntry::info(LogCategory::Dispatch, format!("Rule '{}' matched", rule.name))
                            .with_rule(&rule.id)
                            .with_trigger(trigger_id)
                            .with_action(&rule.action_id)
                            .with_details(json!({ "schedule": rule.schedule })),
                    )
                    .await;
                true
            }
            Ok(false) => {
                debug!(rule_id = %rule.id, "rule conditions not met");
                self.logger
                    .record(
                        LogEntry::info(
                            LogCategory::Dispatch,
                            format!("Rule '{}' skipped: conditions not met", rule.name),
                        )
                        .with_rule(&rule.id)
                        .with_trigger(trigger_id),
                    )
                    .await;
                false
            }
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "rule condition evaluation failed");
                let error = WorkflowError::rule_evaluation(
                    &rule.id,
                    format!("Failed to evaluate conditions for rule '{}': {}", rule.name, e),
                );
                self.logger
                    .log_error(&error, "evaluate_rule", json!({ "trigger_id": trigger_id }))
                    .await;
                false
            }
        }
    }

    async fn run_immediate(&self, trigger_id: &str, rule: &Rule, parameters: &Parameters) -> RuleOutcome {
        let options = self
            .orchestrator
            .default_options()
            .with_context(trigger_context(trigger_id, parameters));
        match self
            .orchestrator
            .execute_action_safely(&rule.action_id, &rule.action_params, Some(rule), options)
            .await
        {
            Ok(result) => RuleOutcome::Executed { result },
            Err(error) => {
                warn!(rule_id = %rule.id, error = %error, "rule action failed");
                RuleOutcome::Failed { error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionFailure, ActionRegistry, TriggerDefinition};
    use crate::engine::SchedulerConfig;
    use crate::error::ErrorKind;
    use crate::persistence::{InMemoryStore, LogCategory};
    use crate::reliability::CircuitBreakerRegistry;
    use crate::rule::Condition;
    use parking_lot::Mutex;

    struct Fixture {
        store: Arc<InMemoryStore>,
        dispatcher: TriggerDispatcher,
        seen: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(rules: Vec<Rule>) -> Fixture {
        let store = Arc::new(InMemoryStore::new().with_rules(rules));
        let logger = ErrorLogger::new(store.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let actions = Arc::new(ActionRegistry::new());
        let recorder = seen.clone();
        actions.register_fn("record", move |ctx, _| {
            recorder.lock().push(ctx.rule_id.unwrap_or_default());
            async { Ok::<_, ActionFailure>(ActionExecutionResult::ok("recorded")) }
        });
        actions.register_fn("reject", |_, _| async {
            Err::<ActionExecutionResult, _>(ActionFailure::non_retryable("invalid input"))
        });

        let triggers = Arc::new(TriggerRegistry::new());
        triggers.register(TriggerDefinition::new("order_created", "Order created"));

        let orchestrator = Arc::new(ActionOrchestrator::new(
            actions,
            Arc::new(CircuitBreakerRegistry::default()),
            store.clone(),
            logger.clone(),
        ));
        let scheduler = DelayedActionScheduler::new(
            store.clone(),
            store.clone(),
            orchestrator.clone(),
            logger.clone(),
            SchedulerConfig::default(),
        );
        let dispatcher =
            TriggerDispatcher::new(triggers, store.clone(), orchestrator, scheduler, logger);

        Fixture {
            store,
            dispatcher,
            seen,
        }
    }

    fn params(value: serde_json::Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_trigger() {
        let f = fixture(vec![]);
        let err = f
            .dispatcher
            .dispatch("nope", Parameters::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Trigger);
        assert!(err.to_string().starts_with("Unknown trigger: nope (Error ID: "));
    }

    #[tokio::test]
    async fn test_conditions_are_anded() {
        let rule = Rule::new("vip", "Big VIP orders", "order_created", "record")
            .with_condition(Condition::greater_than("amount", 100))
            .with_condition(Condition::equals("vip", true));
        let f = fixture(vec![rule]);

        let result = f
            .dispatcher
            .dispatch("order_created", params(json!({"amount": 150, "vip": false})))
            .await
            .unwrap();
        assert_eq!(result.rules_matched, 0);
        assert!(f.seen.lock().is_empty());

        let result = f
            .dispatcher
            .dispatch("order_created", params(json!({"amount": 150, "vip": true})))
            .await
            .unwrap();
        assert_eq!(result.rules_matched, 1);
        assert_eq!(*f.seen.lock(), vec!["vip".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_rules() {
        let f = fixture(vec![
            Rule::new("first", "Rejects", "order_created", "reject"),
            Rule::new("second", "Records", "order_created", "record"),
        ]);

        let result = f
            .dispatcher
            .dispatch("order_created", Parameters::new())
            .await
            .unwrap();

        assert_eq!(result.rules_matched, 2);
        assert!(matches!(result.executed_rules[0].outcome, RuleOutcome::Failed { .. }));
        assert!(matches!(result.executed_rules[1].outcome, RuleOutcome::Executed { .. }));
        assert_eq!(*f.seen.lock(), vec!["second".to_string()]);

        // the failed rule-driven execution was dead-lettered with its trigger payload
        let items = f.store.dlq_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].rule_id, "first");
        assert_eq!(items[0].context["trigger_id"], "order_created");
    }

    #[tokio::test]
    async fn test_evaluation_error_skips_rule() {
        let rule = Rule::new("r1", "Numeric", "order_created", "record")
            .with_condition(Condition::greater_than("amount", 10));
        let f = fixture(vec![rule]);

        let result = f
            .dispatcher
            .dispatch("order_created", params(json!({"amount": "lots"})))
            .await
            .unwrap();

        assert_eq!(result.rules_matched, 0);
        let errors = f.store.logs_in_category(LogCategory::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_delayed_rule_is_scheduled_not_run() {
        let f = fixture(vec![
            Rule::new("later", "Follow up", "order_created", "record").delayed(120),
        ]);

        let result = f
            .dispatcher
            .dispatch("order_created", params(json!({"order": 7})))
            .await
            .unwrap();

        assert_eq!(result.rules_matched, 1);
        assert!(matches!(result.executed_rules[0].outcome, RuleOutcome::Scheduled { .. }));
        assert!(f.seen.lock().is_empty());

        let jobs = f.store.scheduled_actions();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].parameters["order"], 7);
    }

    #[tokio::test]
    async fn test_skips_are_audited() {
        let rule = Rule::new("r1", "Paid only", "order_created", "record")
            .with_condition(Condition::equals("status", "paid"));
        let f = fixture(vec![rule]);

        f.dispatcher
            .dispatch("order_created", params(json!({"status": "pending"})))
            .await
            .unwrap();

        let dispatch_logs = f.store.logs_in_category(LogCategory::Dispatch);
        assert!(dispatch_logs
            .iter()
            .any(|e| e.message.contains("skipped") && e.rule_id.as_deref() == Some("r1")));
        assert!(dispatch_logs
            .iter()
            .any(|e| e.message == "Trigger 'order_created' dispatched"));
    }
}
