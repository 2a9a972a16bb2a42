//! # Triggerflow Engine
//!
//! Rule-triggered action execution with bounded retries, per-action circuit
//! breakers, a durable audit log and a dead letter queue.
//!
//! ## Features
//!
//! - **Rules**: bind a trigger to an action, gated by AND-ed conditions
//! - **Automatic retries**: exponential backoff for transient failures only
//! - **Circuit breakers**: one per action, fail fast while a downstream is down
//! - **Dead letter queue**: exhausted rule-driven invocations are kept for replay
//! - **Durable delays**: delayed rules survive restarts via a scheduled-action table
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TriggerDispatcher                          │
//! │  (matches enabled rules, runs them one by one)              │
//! └─────────────────────────────────────────────────────────────┘
//!              │ immediate                    │ delayed
//!              ▼                              ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │   ActionOrchestrator     │◀──│   DelayedActionScheduler     │
//! │ breaker ▸ retry ▸ action │   │ (timer + DelayedActionPoller)│
//! └──────────────────────────┘   └──────────────────────────────┘
//!              │ exhausted
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          dead_letter_queue  ◀──  DlqProcessor / DlqSweeper   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use triggerflow_durable::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryStore::new().with_rules([
//!     Rule::new("notify", "Notify ops", "order_created", "log_message")
//!         .with_action_params(serde_json::json!({"message": "new order"})),
//! ]));
//!
//! let actions = Arc::new(ActionRegistry::new());
//! register_builtin_actions(&actions);
//!
//! let triggers = Arc::new(TriggerRegistry::new());
//! triggers.register(TriggerDefinition::new("order_created", "Order created"));
//!
//! let engine = Engine::new(store, actions, triggers, EngineConfig::default());
//! let result = engine
//!     .dispatch_trigger("order_created", Parameters::new())
//!     .await
//!     .unwrap();
//! assert_eq!(result.rules_matched, 1);
//! # }
//! ```

pub mod action;
pub mod config;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod reliability;
pub mod rule;
pub mod runtime;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::action::{
        register_builtin_actions, ActionContext, ActionExecutionResult, ActionFailure,
        ActionHandler, ActionRegistry, TriggerDefinition, TriggerRegistry,
    };
    pub use crate::config::EngineConfig;
    pub use crate::dlq::{BatchOptions, BatchReport, DlqProcessor};
    pub use crate::engine::{DispatchResult, ExecuteOptions, RuleOutcome};
    pub use crate::error::{ErrorKind, WorkflowError};
    pub use crate::persistence::{
        DlqItem, DlqStatus, InMemoryStore, PostgresStore, Store, StoreError,
    };
    pub use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
    pub use crate::rule::{Condition, ConditionOperator, Parameters, Rule, Schedule};
    pub use crate::runtime::Engine;
}

// Re-export key types at crate root
pub use action::{ActionExecutionResult, ActionFailure, ActionHandler, ActionRegistry, TriggerRegistry};
pub use config::{ConfigError, EngineConfig};
pub use dlq::{BatchOptions, BatchReport, DlqProcessor, ItemResult};
pub use engine::{
    ActionOrchestrator, DelayedActionScheduler, DispatchResult, ExecuteOptions, TriggerDispatcher,
};
pub use error::{ErrorKind, WorkflowError};
pub use logging::ErrorLogger;
pub use persistence::{InMemoryStore, PostgresStore, Store, StoreError};
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use rule::{Condition, Parameters, Rule};
pub use runtime::Engine;
