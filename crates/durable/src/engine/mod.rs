//! Rule execution engine
//!
//! - [`TriggerDispatcher`] matches rules for a trigger and runs them
//! - [`ActionOrchestrator`] executes one action with retries, breaker and DLQ escalation
//! - [`DelayedActionScheduler`] persists and fires delayed rule executions

mod dispatcher;
mod orchestrator;
mod scheduler;

pub use dispatcher::{DispatchResult, DispatchedRule, RuleOutcome, TriggerDispatcher};
pub use orchestrator::{ActionOrchestrator, ExecuteOptions, ExecutionFailure};
pub use scheduler::{DelayedActionScheduler, SchedulerConfig};

use crate::rule::Parameters;

/// Replay context recorded for rule-driven executions
pub(crate) fn trigger_context(trigger_id: &str, parameters: &Parameters) -> Parameters {
    let mut context = Parameters::new();
    context.insert("trigger_id".into(), trigger_id.into());
    context.insert(
        "trigger_params".into(),
        serde_json::Value::Object(parameters.clone()),
    );
    context
}
