//! Engine wiring
//!
//! [`Engine`] builds every component over a single [`Store`] and exposes the
//! in-process call surface: dispatch, ad hoc execution and DLQ reprocessing.

use std::sync::Arc;

use uuid::Uuid;

use crate::action::{ActionExecutionResult, ActionRegistry, TriggerRegistry};
use crate::config::EngineConfig;
use crate::dlq::{BatchOptions, BatchReport, DlqProcessor};
use crate::engine::{
    ActionOrchestrator, DelayedActionScheduler, DispatchResult, ExecuteOptions, TriggerDispatcher,
};
use crate::error::WorkflowError;
use crate::logging::ErrorLogger;
use crate::persistence::Store;
use crate::reliability::CircuitBreakerRegistry;
use crate::rule::{Parameters, Rule};
use crate::worker::{BackgroundJobs, DelayedActionPoller, DlqSweeper};

/// A fully wired rule engine
pub struct Engine {
    config: EngineConfig,
    logger: ErrorLogger,
    breakers: Arc<CircuitBreakerRegistry>,
    orchestrator: Arc<ActionOrchestrator>,
    scheduler: DelayedActionScheduler,
    dispatcher: TriggerDispatcher,
    dlq: Arc<DlqProcessor>,
}

impl Engine {
    pub fn new<S: Store>(
        store: Arc<S>,
        actions: Arc<ActionRegistry>,
        triggers: Arc<TriggerRegistry>,
        config: EngineConfig,
    ) -> Self {
        let logger = ErrorLogger::new(store.clone());
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone())
                .with_logger(Arc::new(logger.clone())),
        );

        let orchestrator = Arc::new(
            ActionOrchestrator::new(actions, breakers.clone(), store.clone(), logger.clone())
                .with_retry_policy(config.retry.clone()),
        );
        let scheduler = DelayedActionScheduler::new(
            store.clone(),
            store.clone(),
            orchestrator.clone(),
            logger.clone(),
            config.scheduler.clone(),
        );
        let dispatcher = TriggerDispatcher::new(
            triggers,
            store.clone(),
            orchestrator.clone(),
            scheduler.clone(),
            logger.clone(),
        );
        let dlq = Arc::new(
            DlqProcessor::new(store.clone(), store, orchestrator.clone(), logger.clone())
                .with_max_retry_attempts(config.dlq.max_retry_attempts),
        );

        Self {
            config,
            logger,
            breakers,
            orchestrator,
            scheduler,
            dispatcher,
            dlq,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn logger(&self) -> &ErrorLogger {
        &self.logger
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn orchestrator(&self) -> &Arc<ActionOrchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &DelayedActionScheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &TriggerDispatcher {
        &self.dispatcher
    }

    pub fn dlq(&self) -> &Arc<DlqProcessor> {
        &self.dlq
    }

    pub async fn dispatch_trigger(
        &self,
        trigger_id: &str,
        parameters: Parameters,
    ) -> Result<DispatchResult, WorkflowError> {
        self.dispatcher.dispatch(trigger_id, parameters).await
    }

    /// Run an action directly; `rule` makes the call rule-driven
    pub async fn execute_action_safely(
        &self,
        action_id: &str,
        parameters: &Parameters,
        rule: Option<&Rule>,
        options: ExecuteOptions,
    ) -> Result<ActionExecutionResult, WorkflowError> {
        self.orchestrator
            .execute_action_safely(action_id, parameters, rule, options)
            .await
    }

    pub async fn process_dlq_batch(
        &self,
        limit: u32,
        options: BatchOptions,
    ) -> Result<BatchReport, WorkflowError> {
        self.dlq.process_batch(limit, options).await
    }

    pub async fn retry_dlq_item(&self, id: Uuid) -> Result<ActionExecutionResult, WorkflowError> {
        self.dlq.retry_item(id).await
    }

    /// Spawn the DLQ sweeper and the delayed action poller
    pub fn start_background_jobs(&self) -> BackgroundJobs {
        BackgroundJobs::start(
            DlqSweeper::new(self.dlq.clone(), self.config.dlq.clone()),
            DelayedActionPoller::new(self.scheduler.clone()),
        )
    }
}
