//! Durable delayed execution
//!
//! A delayed rule is persisted as a [`ScheduledAction`] row, the system of
//! record. Short delays also get an in-process timer; anything the timer
//! misses (restart, long delay) is picked up by the
//! [`DelayedActionPoller`](crate::worker::DelayedActionPoller). Both paths
//! go through an atomic claim, so a job runs at most once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::orchestrator::ActionOrchestrator;
use super::trigger_context;
use crate::error::WorkflowError;
use crate::logging::{ErrorLogger, LogCategory, LogEntry};
use crate::persistence::{RuleStore, ScheduledAction, ScheduledActionStatus, ScheduledActionStore};
use crate::reliability::duration_millis;
use crate::rule::{Parameters, Rule};

/// Delayed scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Delays up to this long also get an in-process timer
    #[serde(with = "duration_millis")]
    pub timer_horizon: Duration,

    /// How often the poller looks for due jobs
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum jobs claimed per poll
    pub batch_size: u32,

    /// Claims older than this are returned to `Pending` by the poller
    #[serde(with = "duration_millis")]
    pub stale_claim_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timer_horizon: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
            stale_claim_threshold: Duration::from_secs(900),
        }
    }
}

impl SchedulerConfig {
    pub fn with_timer_horizon(mut self, horizon: Duration) -> Self {
        self.timer_horizon = horizon;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_stale_claim_threshold(mut self, threshold: Duration) -> Self {
        self.stale_claim_threshold = threshold;
        self
    }
}

struct SchedulerInner {
    jobs: Arc<dyn ScheduledActionStore>,
    rules: Arc<dyn RuleStore>,
    orchestrator: Arc<ActionOrchestrator>,
    logger: ErrorLogger,
    config: SchedulerConfig,
}

/// Persists delayed rule executions and fires them when due
///
/// Cheap to clone; clones share the same stores.
#[derive(Clone)]
pub struct DelayedActionScheduler {
    inner: Arc<SchedulerInner>,
}

impl DelayedActionScheduler {
    pub fn new(
        jobs: Arc<dyn ScheduledActionStore>,
        rules: Arc<dyn RuleStore>,
        orchestrator: Arc<ActionOrchestrator>,
        logger: ErrorLogger,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs,
                rules,
                orchestrator,
                logger,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Persist a job for `rule` due after its delay, returning the stored row
    ///
    /// Returns without waiting for the job to run.
    #[instrument(skip(self, rule, parameters), fields(rule_id = %rule.id))]
    pub async fn schedule(
        &self,
        rule: &Rule,
        parameters: Parameters,
    ) -> Result<ScheduledAction, WorkflowError> {
        let delay = rule.delay();
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).map_err(|e| {
                WorkflowError::scheduling(format!("Invalid delay for rule '{}': {}", rule.id, e))
            })?;
        let job = ScheduledAction::new(rule, parameters, run_at);

        if let Err(e) = self.inner.jobs.schedule_action(job.clone()).await {
            let error = WorkflowError::scheduling(format!(
                "Failed to schedule delayed action for rule '{}': {}",
                rule.id, e
            ));
            let error_id = self
                .inner
                .logger
                .log_error(&error, "schedule_delayed_action", json!({ "rule_id": rule.id }))
                .await;
            return Err(error.with_error_id(error_id));
        }

        if delay <= self.inner.config.timer_horizon {
            self.arm_timer(job.id, delay);
        }

        info!(job_id = %job.id, %run_at, delay_minutes = rule.delay_minutes, "delayed action scheduled");
        self.inner
            .logger
            .record(
                LogEntry::info(
                    LogCategory::Scheduler,
                    format!(
                        "Action '{}' scheduled in {} minutes",
                        rule.action_id, rule.delay_minutes
                    ),
                )
                .with_rule(&rule.id)
                .with_trigger(&rule.trigger_id)
                .with_action(&rule.action_id)
                .with_details(json!({ "job_id": job.id, "run_at": run_at })),
            )
            .await;

        Ok(job)
    }

    fn arm_timer(&self, job_id: Uuid, delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = scheduler.fire(job_id).await {
                warn!(%job_id, error = %e, "delayed action timer failed");
            }
        });
    }

    /// Claim and run one job
    ///
    /// Returns `None` when the job was already claimed, finished or cancelled.
    #[instrument(skip(self))]
    pub async fn fire(&self, job_id: Uuid) -> Result<Option<ScheduledActionStatus>, WorkflowError> {
        match self.inner.jobs.claim_scheduled_action(job_id).await? {
            Some(job) => self.run_claimed(job).await.map(Some),
            None => {
                debug!(%job_id, "delayed action no longer pending");
                Ok(None)
            }
        }
    }

    /// Claim and run every job due at `now`, earliest first
    ///
    /// Jobs run one after another; returns how many were run.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize, WorkflowError> {
        let jobs = self
            .inner
            .jobs
            .claim_due_actions(now, self.inner.config.batch_size)
            .await?;

        let count = jobs.len();
        for job in jobs {
            let job_id = job.id;
            if let Err(e) = self.run_claimed(job).await {
                warn!(%job_id, error = %e, "delayed action failed to run");
            }
        }
        Ok(count)
    }

    /// Return jobs whose claim is older than the stale threshold to `Pending`
    ///
    /// A claimed job whose process died never finishes; after this it is due
    /// again and the next [`run_due`](Self::run_due) picks it up.
    pub async fn reclaim_stale(&self) -> Result<usize, WorkflowError> {
        let reclaimed = self
            .inner
            .jobs
            .reclaim_stale_scheduled_actions(self.inner.config.stale_claim_threshold)
            .await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed stale delayed actions");
            self.inner
                .logger
                .record(
                    LogEntry::warn(
                        LogCategory::Scheduler,
                        format!("Reclaimed {} stale delayed action(s)", reclaimed.len()),
                    )
                    .with_details(json!({ "job_ids": reclaimed })),
                )
                .await;
        }
        Ok(reclaimed.len())
    }

    /// Cancel every pending job for `rule_id`
    pub async fn cancel_for_rule(&self, rule_id: &str) -> Result<u64, WorkflowError> {
        let cancelled = self.inner.jobs.cancel_scheduled_for_rule(rule_id).await?;
        if cancelled > 0 {
            info!(rule_id, cancelled, "cancelled delayed actions");
            self.inner
                .logger
                .record(
                    LogEntry::info(
                        LogCategory::Scheduler,
                        format!("Cancelled {} delayed actions", cancelled),
                    )
                    .with_rule(rule_id),
                )
                .await;
        }
        Ok(cancelled)
    }

    async fn run_claimed(&self, job: ScheduledAction) -> Result<ScheduledActionStatus, WorkflowError> {
        let rule = match self.inner.rules.get_rule(&job.rule_id).await {
            Ok(rule) => rule,
            Err(e) => {
                self.finish(&job, ScheduledActionStatus::Failed, Some(e.to_string()))
                    .await?;
                return Err(e.into());
            }
        };

        // the rule is re-read at fire time; disabling or deleting it retracts the job
        let rule = match rule {
            Some(rule) if rule.enabled => rule,
            other => {
                let reason = if other.is_some() {
                    "rule disabled"
                } else {
                    "rule not found"
                };
                info!(job_id = %job.id, rule_id = %job.rule_id, reason, "delayed action cancelled");
                self.inner
                    .logger
                    .record(
                        LogEntry::warn(
                            LogCategory::Scheduler,
                            format!("Delayed action cancelled: {}", reason),
                        )
                        .with_rule(&job.rule_id)
                        .with_trigger(&job.trigger_id)
                        .with_details(json!({ "job_id": job.id })),
                    )
                    .await;
                self.finish(&job, ScheduledActionStatus::Cancelled, Some(reason.to_string()))
                    .await?;
                return Ok(ScheduledActionStatus::Cancelled);
            }
        };

        let mut context = trigger_context(&job.trigger_id, &job.parameters);
        context.insert("scheduled_action_id".into(), json!(job.id));

        let outcome = self
            .inner
            .orchestrator
            .execute_action_safely(
                &rule.action_id,
                &rule.action_params,
                Some(&rule),
                self.inner.orchestrator.default_options().with_context(context),
            )
            .await;

        let (status, error) = match outcome {
            Ok(_) => (ScheduledActionStatus::Completed, None),
            Err(e) => (ScheduledActionStatus::Failed, Some(e.to_string())),
        };
        self.finish(&job, status, error).await?;
        Ok(status)
    }

    async fn finish(
        &self,
        job: &ScheduledAction,
        status: ScheduledActionStatus,
        error: Option<String>,
    ) -> Result<(), WorkflowError> {
        self.inner
            .jobs
            .finish_scheduled_action(job.id, status, error)
            .await?;
        debug!(job_id = %job.id, %status, "delayed action finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionExecutionResult, ActionFailure, ActionRegistry};
    use crate::persistence::InMemoryStore;
    use crate::reliability::CircuitBreakerRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scheduler(store: &Arc<InMemoryStore>, calls: Arc<AtomicU32>) -> DelayedActionScheduler {
        let actions = Arc::new(ActionRegistry::new());
        actions.register_fn("notify", move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ActionFailure>(ActionExecutionResult::ok("sent")) }
        });
        let logger = ErrorLogger::new(store.clone());
        let orchestrator = Arc::new(ActionOrchestrator::new(
            actions,
            Arc::new(CircuitBreakerRegistry::default()),
            store.clone(),
            logger.clone(),
        ));
        DelayedActionScheduler::new(
            store.clone(),
            store.clone(),
            orchestrator,
            logger,
            SchedulerConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let store = Arc::new(InMemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let scheduler = scheduler(&store, calls.clone());
        let rule = Rule::new("r1", "Follow up", "t1", "notify").delayed(5);
        store.save_rule(rule.clone()).await.unwrap();

        let job = scheduler.schedule(&rule, Parameters::new()).await.unwrap();
        assert_eq!(job.status, ScheduledActionStatus::Pending);

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let job = store.get_scheduled_action(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, ScheduledActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_fire_cancels_when_rule_disabled() {
        let store = Arc::new(InMemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let scheduler = scheduler(&store, calls.clone());
        let rule = Rule::new("r1", "Follow up", "t1", "notify").delayed(90);
        store.save_rule(rule.clone()).await.unwrap();

        let job = scheduler.schedule(&rule, Parameters::new()).await.unwrap();
        store.save_rule(rule.disabled()).await.unwrap();

        let status = scheduler.fire(job.id).await.unwrap();
        assert_eq!(status, Some(ScheduledActionStatus::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // a second fire is a no-op
        assert_eq!(scheduler.fire(job.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fire_cancels_when_rule_deleted() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(&store, Arc::new(AtomicU32::new(0)));
        let rule = Rule::new("r1", "Follow up", "t1", "notify").delayed(90);

        let job = scheduler.schedule(&rule, Parameters::new()).await.unwrap();
        let status = scheduler.fire(job.id).await.unwrap();

        assert_eq!(status, Some(ScheduledActionStatus::Cancelled));
        let job = store.get_scheduled_action(job.id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("rule not found"));
    }

    #[tokio::test]
    async fn test_run_due_runs_past_jobs() {
        let store = Arc::new(InMemoryStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let scheduler = scheduler(&store, calls.clone());
        let rule = Rule::new("r1", "Follow up", "t1", "notify").delayed(120);
        store.save_rule(rule.clone()).await.unwrap();

        // beyond the timer horizon, so only the poller path runs it
        scheduler.schedule(&rule, Parameters::new()).await.unwrap();
        assert_eq!(scheduler.run_due(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::minutes(121);
        assert_eq!(scheduler.run_due(later).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_for_rule() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(&store, Arc::new(AtomicU32::new(0)));
        let rule = Rule::new("r1", "Follow up", "t1", "notify").delayed(120);

        scheduler.schedule(&rule, Parameters::new()).await.unwrap();
        scheduler.schedule(&rule, Parameters::new()).await.unwrap();

        assert_eq!(scheduler.cancel_for_rule("r1").await.unwrap(), 2);
        assert!(store
            .scheduled_actions()
            .iter()
            .all(|a| a.status == ScheduledActionStatus::Cancelled));
    }
}
