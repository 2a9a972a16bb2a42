//! Dead letter queue reprocessing
//!
//! Items are replayed against the rule as it is *now*, not as it was when
//! the original invocation failed. Each replay gets a single extra attempt
//! and updates the existing item in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::action::ActionExecutionResult;
use crate::engine::{ActionOrchestrator, ExecuteOptions};
use crate::error::WorkflowError;
use crate::logging::{ErrorLogger, LogCategory, LogEntry};
use crate::persistence::{DeadLetterStore, DlqBatchQuery, DlqItem, DlqStatus, RuleStore};

/// Default ceiling on reprocessing attempts per item
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Selection options for [`DlqProcessor::process_batch`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Only items that failed at least this many minutes ago
    #[serde(default)]
    pub older_than_minutes: Option<u32>,

    /// Restrict the batch to these items
    #[serde(default)]
    pub specific_ids: Option<Vec<Uuid>>,

    pub max_retry_attempts: u32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            older_than_minutes: None,
            specific_ids: None,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }
}

impl BatchOptions {
    pub fn older_than_minutes(mut self, minutes: u32) -> Self {
        self.older_than_minutes = Some(minutes);
        self
    }

    pub fn with_ids(mut self, ids: Vec<Uuid>) -> Self {
        self.specific_ids = Some(ids);
        self
    }

    pub fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = max;
        self
    }
}

/// Outcome of reprocessing one item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub id: Uuid,
    pub rule_id: String,
    /// Status the item was left in
    pub status: DlqStatus,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub processed: u32,
    pub results: Vec<ItemResult>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// Replays dead-lettered invocations
pub struct DlqProcessor {
    dlq: Arc<dyn DeadLetterStore>,
    rules: Arc<dyn RuleStore>,
    orchestrator: Arc<ActionOrchestrator>,
    logger: ErrorLogger,
    sweep_lock: Mutex<()>,
    max_retry_attempts: u32,
}

impl DlqProcessor {
    pub fn new(
        dlq: Arc<dyn DeadLetterStore>,
        rules: Arc<dyn RuleStore>,
        orchestrator: Arc<ActionOrchestrator>,
        logger: ErrorLogger,
    ) -> Self {
        Self {
            dlq,
            rules,
            orchestrator,
            logger,
            sweep_lock: Mutex::new(()),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }

    /// Ceiling used by [`retry_item`](Self::retry_item)
    pub fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = max.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dlq
    }

    /// Reprocess up to `limit` eligible items, oldest first, one at a time
    ///
    /// Only one batch may run at a time; a concurrent call fails with a
    /// `SchedulingError` instead of waiting.
    #[instrument(skip(self, options), fields(max_retry_attempts = options.max_retry_attempts))]
    pub async fn process_batch(
        &self,
        limit: u32,
        options: BatchOptions,
    ) -> Result<BatchReport, WorkflowError> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            warn!("DLQ batch already running");
            return Err(WorkflowError::scheduling(
                "DLQ batch processing is already in progress",
            ));
        };

        let query = DlqBatchQuery {
            limit,
            older_than: options
                .older_than_minutes
                .map(|minutes| Utc::now() - ChronoDuration::minutes(i64::from(minutes))),
            ids: options.specific_ids.clone(),
            max_retry_attempts: options.max_retry_attempts,
        };

        let items = match self.dlq.select_dlq_batch(&query).await {
            Ok(items) => items,
            Err(e) => {
                let error: WorkflowError = e.into();
                let error_id = self
                    .logger
                    .log_error(&error, "process_dlq_batch", json!({ "limit": limit }))
                    .await;
                return Err(error.with_error_id(error_id));
            }
        };

        let mut report = BatchReport::default();
        for item in items {
            let result = self.process_item(item, options.max_retry_attempts).await;
            report.processed += 1;
            report.results.push(result);
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded(),
            "DLQ batch finished"
        );
        self.logger
            .record(
                LogEntry::info(
                    LogCategory::Dlq,
                    format!("Processed {} DLQ item(s)", report.processed),
                )
                .with_details(json!({
                    "processed": report.processed,
                    "succeeded": report.succeeded(),
                    "limit": limit,
                })),
            )
            .await;

        Ok(report)
    }

    /// Reprocess one item by id, outside of any batch
    ///
    /// Fails with a `ConfigurationError` for unknown ids and when the item
    /// is not `Pending`. A failed replay is returned as an `ActionError`
    /// after the item has been updated. A successful replay whose new status
    /// could not be stored is a `DatabaseError`; the item stays queued.
    #[instrument(skip(self))]
    pub async fn retry_item(&self, id: Uuid) -> Result<ActionExecutionResult, WorkflowError> {
        let item = self
            .dlq
            .get_dlq_item(id)
            .await?
            .ok_or_else(|| WorkflowError::configuration(format!("DLQ item not found: {}", id)))?;

        if item.status != DlqStatus::Pending {
            return Err(WorkflowError::configuration(format!(
                "DLQ item {} is {} and cannot be retried",
                id, item.status
            )));
        }

        let (result, outcome) = self.reprocess(item, self.max_retry_attempts).await;
        match outcome {
            Some(Ok(execution)) if result.status == DlqStatus::Processed => Ok(execution),
            Some(Ok(_)) => Err(WorkflowError::database(
                format!(
                    "DLQ item {} was replayed but could not be marked processed (status: {})",
                    id, result.status
                ),
                None,
            )),
            Some(Err(error)) => Err(error),
            None => Err(WorkflowError::configuration(result.message)),
        }
    }

    /// Hand items claimed more than `stale_threshold` ago back to `Pending`
    ///
    /// Covers replays cut short by a crash or an aborted shutdown. The
    /// interrupted attempt is not counted.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(&self, stale_threshold: Duration) -> Result<usize, WorkflowError> {
        let reclaimed = self.dlq.reclaim_stale_dlq_items(stale_threshold).await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed stale DLQ items");
            self.logger
                .record(
                    LogEntry::warn(
                        LogCategory::Dlq,
                        format!("Reclaimed {} stale DLQ item(s)", reclaimed.len()),
                    )
                    .with_details(json!({ "dlq_item_ids": reclaimed })),
                )
                .await;
        }
        Ok(reclaimed.len())
    }

    /// Reprocess an item selected by a batch; never fails
    pub async fn process_item(&self, item: DlqItem, max_retry_attempts: u32) -> ItemResult {
        self.reprocess(item, max_retry_attempts).await.0
    }

    /// Returns the item result plus the action outcome when the action ran
    async fn reprocess(
        &self,
        item: DlqItem,
        max_retry_attempts: u32,
    ) -> (ItemResult, Option<Result<ActionExecutionResult, WorkflowError>>) {
        let mut item = match self.dlq.begin_dlq_processing(item.id).await {
            Ok(item) => item,
            Err(e) => {
                warn!(dlq_item_id = %item.id, error = %e, "could not claim DLQ item");
                let result = ItemResult {
                    id: item.id,
                    rule_id: item.rule_id,
                    status: item.status,
                    success: false,
                    message: format!("Could not claim DLQ item: {}", e),
                    error_id: None,
                };
                return (result, None);
            }
        };

        let rule = match self.rules.get_rule(&item.rule_id).await {
            Ok(rule) => rule,
            Err(e) => {
                let error: WorkflowError = e.into();
                let error_id = self
                    .logger
                    .log_error(&error, "process_dlq_item", json!({ "dlq_item_id": item.id }))
                    .await;
                self.release(&mut item).await;
                let result = ItemResult {
                    id: item.id,
                    rule_id: item.rule_id.clone(),
                    status: item.status,
                    success: false,
                    message: error.message().to_string(),
                    error_id: Some(error_id),
                };
                return (result, None);
            }
        };

        let Some(rule) = rule else {
            let message = format!("Rule not found: {}", item.rule_id);
            item.mark_failed(json!({ "success": false, "error": message }));
            let status = self.save(&mut item, &message).await;
            let result = ItemResult {
                id: item.id,
                rule_id: item.rule_id.clone(),
                status,
                success: false,
                message,
                error_id: None,
            };
            return (result, None);
        };

        let options = ExecuteOptions::dlq_retry(item.context.clone());
        let outcome = self
            .orchestrator
            .execute_action(&rule.action_id, &rule.action_params, Some(&rule), options)
            .await;

        match outcome {
            Ok(execution) => {
                item.record_success(json!({
                    "success": true,
                    "message": execution.message,
                    "extra": execution.extra,
                }));
                let message = format!("Reprocessed DLQ item for rule '{}'", rule.name);
                let status = self.save(&mut item, &message).await;
                let result = ItemResult {
                    id: item.id,
                    rule_id: item.rule_id.clone(),
                    status,
                    success: status == DlqStatus::Processed,
                    message: execution.message.clone(),
                    error_id: None,
                };
                (result, Some(Ok(execution)))
            }
            Err(failure) => {
                item.record_failure(
                    json!({
                        "success": false,
                        "error": failure.error.message(),
                        "error_id": failure.error_id,
                    }),
                    max_retry_attempts,
                );
                let message = format!(
                    "DLQ retry {} of {} failed for rule '{}'",
                    item.retry_attempts, max_retry_attempts, rule.name
                );
                let status = self.save(&mut item, &message).await;
                let result = ItemResult {
                    id: item.id,
                    rule_id: item.rule_id.clone(),
                    status,
                    success: false,
                    message: failure.error.message().to_string(),
                    error_id: Some(failure.error_id),
                };
                (result, Some(Err(failure.into_error())))
            }
        }
    }

    /// Persist the item's new state, returning the status actually stored
    async fn save(&self, item: &mut DlqItem, message: &str) -> DlqStatus {
        if let Err(e) = self.dlq.save_dlq_item(item).await {
            let error: WorkflowError = e.into();
            self.logger
                .log_error(&error, "process_dlq_item", json!({ "dlq_item_id": item.id }))
                .await;
            self.release(item).await;
            return item.status;
        }

        let entry = match item.status {
            DlqStatus::Failed => LogEntry::warn(LogCategory::Dlq, message),
            _ => LogEntry::info(LogCategory::Dlq, message),
        };
        self.logger
            .record(
                entry
                    .with_rule(&item.rule_id)
                    .with_trigger(&item.trigger_id)
                    .with_action(&item.action_id)
                    .with_details(json!({
                        "dlq_item_id": item.id,
                        "status": item.status,
                        "retry_attempts": item.retry_attempts,
                    })),
            )
            .await;
        item.status
    }

    /// Best-effort return to `Pending` after a storage failure
    async fn release(&self, item: &mut DlqItem) {
        let mut reverted = item.clone();
        reverted.status = DlqStatus::Pending;
        // retry_attempts may already be bumped; keep the stored count
        if let Ok(Some(stored)) = self.dlq.get_dlq_item(item.id).await {
            reverted.retry_attempts = stored.retry_attempts;
            reverted.last_processed_at = stored.last_processed_at;
            reverted.processing_result = stored.processing_result;
        }
        match self.dlq.save_dlq_item(&reverted).await {
            Ok(()) => *item = reverted,
            Err(e) => {
                warn!(dlq_item_id = %item.id, error = %e, "could not release DLQ item");
                item.status = DlqStatus::Processing;
            }
        }
    }
}
