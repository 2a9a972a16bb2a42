//! Storage traits and persisted row types

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rule::{Parameters, Rule};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Rule not found
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// DLQ item not found
    #[error("dead letter queue item not found: {0}")]
    DlqItemNotFound(Uuid),

    /// Scheduled action not found
    #[error("scheduled action not found: {0}")]
    ScheduledActionNotFound(Uuid),

    /// Status change not allowed by the row's state machine
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

// =============================================================================
// Logs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// What part of the engine wrote a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Dispatch,
    Execution,
    Retry,
    Error,
    Dlq,
    CircuitBreaker,
    Scheduler,
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch => write!(f, "dispatch"),
            Self::Execution => write!(f, "execution"),
            Self::Retry => write!(f, "retry"),
            Self::Error => write!(f, "error"),
            Self::Dlq => write!(f, "dlq"),
            Self::CircuitBreaker => write!(f, "circuit_breaker"),
            Self::Scheduler => write!(f, "scheduler"),
        }
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    pub rule_id: Option<String>,
    pub trigger_id: Option<String>,
    pub action_id: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, category: LogCategory, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            level,
            category,
            message: message.into(),
            rule_id: None,
            trigger_id: None,
            action_id: None,
            details: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn info(category: LogCategory, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, category, message)
    }

    pub fn warn(category: LogCategory, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, category, message)
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_trigger(mut self, trigger_id: impl Into<String>) -> Self {
        self.trigger_id = Some(trigger_id.into());
        self
    }

    pub fn with_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

// =============================================================================
// Dead letter queue
// =============================================================================

/// DLQ item status
///
/// `Pending → Processing → {Processed | Pending | Failed}`. `Processed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl DlqStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: DlqStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Pending | Self::Processing) => true,
            (Self::Processing, Self::Processed | Self::Pending | Self::Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown DLQ status: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule-driven action invocation that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqItem {
    pub id: Uuid,
    pub rule_id: String,
    pub rule_name: String,
    pub trigger_id: String,
    pub action_id: String,
    pub action_params: Parameters,
    /// Replay context, e.g. the originating trigger payload
    pub context: Parameters,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub status: DlqStatus,
    pub retry_attempts: u32,
    pub timestamp: DateTime<Utc>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub processing_result: Option<serde_json::Value>,
    /// Set while `Processing`; a stale claim is returned to `Pending`
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl DlqItem {
    /// New `Pending` item with zero retry attempts
    pub fn from_failure(
        rule: &Rule,
        error_message: impl Into<String>,
        stack_trace: Option<String>,
        context: Parameters,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            trigger_id: rule.trigger_id.clone(),
            action_id: rule.action_id.clone(),
            action_params: rule.action_params.clone(),
            context,
            error_message: error_message.into(),
            stack_trace,
            status: DlqStatus::Pending,
            retry_attempts: 0,
            timestamp: Utc::now(),
            last_processed_at: None,
            processing_result: None,
            claimed_at: None,
        }
    }

    /// Reprocessing succeeded
    pub fn record_success(&mut self, result: serde_json::Value) {
        self.retry_attempts += 1;
        self.status = DlqStatus::Processed;
        self.claimed_at = None;
        self.last_processed_at = Some(Utc::now());
        self.processing_result = Some(result);
    }

    /// Reprocessing failed; terminal once `max_retry_attempts` is reached
    pub fn record_failure(&mut self, result: serde_json::Value, max_retry_attempts: u32) {
        self.retry_attempts += 1;
        self.status = if self.retry_attempts >= max_retry_attempts {
            DlqStatus::Failed
        } else {
            DlqStatus::Pending
        };
        self.claimed_at = None;
        self.last_processed_at = Some(Utc::now());
        self.processing_result = Some(result);
    }

    /// Give up without an attempt (e.g. the rule no longer exists)
    pub fn mark_failed(&mut self, result: serde_json::Value) {
        self.status = DlqStatus::Failed;
        self.claimed_at = None;
        self.last_processed_at = Some(Utc::now());
        self.processing_result = Some(result);
    }
}

/// Filter for listing DLQ entries
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub status: Option<DlqStatus>,
    pub rule_id: Option<String>,
    pub action_id: Option<String>,
}

impl DlqFilter {
    pub fn matches(&self, item: &DlqItem) -> bool {
        self.status.map_or(true, |s| item.status == s)
            && self.rule_id.as_ref().map_or(true, |r| &item.rule_id == r)
            && self.action_id.as_ref().map_or(true, |a| &item.action_id == a)
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Selection criteria for a reprocessing batch
///
/// Only `Pending` items with `retry_attempts < max_retry_attempts` are
/// eligible; results are ordered oldest first.
#[derive(Debug, Clone)]
pub struct DlqBatchQuery {
    pub limit: u32,
    /// Only items created before this instant
    pub older_than: Option<DateTime<Utc>>,
    /// Restrict to these ids
    pub ids: Option<Vec<Uuid>>,
    pub max_retry_attempts: u32,
}

impl DlqBatchQuery {
    pub fn is_eligible(&self, item: &DlqItem) -> bool {
        item.status == DlqStatus::Pending
            && item.retry_attempts < self.max_retry_attempts
            && self.older_than.map_or(true, |cutoff| item.timestamp < cutoff)
            && self.ids.as_ref().map_or(true, |ids| ids.contains(&item.id))
    }
}

/// Item counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
}

// =============================================================================
// Scheduled (delayed) actions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledActionStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

impl ScheduledActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Serialization(format!(
                "unknown scheduled action status: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ScheduledActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delayed rule execution persisted until it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: Uuid,
    pub rule_id: String,
    pub trigger_id: String,
    /// Trigger payload captured at dispatch
    pub parameters: Parameters,
    pub run_at: DateTime<Utc>,
    pub status: ScheduledActionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// When the current claim was taken
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl ScheduledAction {
    pub fn new(rule: &Rule, parameters: Parameters, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            rule_id: rule.id.clone(),
            trigger_id: rule.trigger_id.clone(),
            parameters,
            run_at,
            status: ScheduledActionStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            claimed_at: None,
        }
    }
}

// =============================================================================
// Store traits
// =============================================================================

/// Read access to user-defined rules (owned outside the engine)
#[async_trait]
pub trait RuleStore: Send + Sync + 'static {
    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, StoreError>;

    /// Enabled rules bound to `trigger_id`
    async fn enabled_rules_for_trigger(&self, trigger_id: &str) -> Result<Vec<Rule>, StoreError>;

    /// Insert or replace a rule
    async fn save_rule(&self, rule: Rule) -> Result<(), StoreError>;

    /// Returns whether a rule was removed
    async fn delete_rule(&self, rule_id: &str) -> Result<bool, StoreError>;
}

/// Append-only durable log
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError>;
}

/// Durable dead letter queue
///
/// Implementations must make single-row writes atomic.
#[async_trait]
pub trait DeadLetterStore: Send + Sync + 'static {
    async fn enqueue_dlq_item(&self, item: DlqItem) -> Result<DlqItem, StoreError>;

    async fn get_dlq_item(&self, id: Uuid) -> Result<Option<DlqItem>, StoreError>;

    /// Newest first
    async fn list_dlq_items(
        &self,
        filter: DlqFilter,
        pagination: Pagination,
    ) -> Result<Vec<DlqItem>, StoreError>;

    /// Eligible items, oldest first, at most `query.limit`
    async fn select_dlq_batch(&self, query: &DlqBatchQuery) -> Result<Vec<DlqItem>, StoreError>;

    /// Atomically move a `Pending` item to `Processing`
    async fn begin_dlq_processing(&self, id: Uuid) -> Result<DlqItem, StoreError>;

    /// Persist an updated item, rejecting illegal status changes and
    /// decreasing retry counters
    async fn save_dlq_item(&self, item: &DlqItem) -> Result<(), StoreError>;

    /// Return `Processing` items claimed more than `stale_threshold` ago to
    /// `Pending`, keeping their `retry_attempts`; returns the reclaimed ids
    async fn reclaim_stale_dlq_items(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Operator-only removal
    async fn delete_dlq_item(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn dlq_stats(&self) -> Result<DlqStats, StoreError>;
}

/// Durable store of delayed actions
#[async_trait]
pub trait ScheduledActionStore: Send + Sync + 'static {
    async fn schedule_action(&self, action: ScheduledAction) -> Result<(), StoreError>;

    async fn get_scheduled_action(&self, id: Uuid) -> Result<Option<ScheduledAction>, StoreError>;

    /// Atomically move a `Pending` action to `Claimed`; `None` if it is not pending
    async fn claim_scheduled_action(&self, id: Uuid)
        -> Result<Option<ScheduledAction>, StoreError>;

    /// Claim pending actions with `run_at <= now`, earliest first
    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledAction>, StoreError>;

    /// Record the final status of a claimed action
    async fn finish_scheduled_action(
        &self,
        id: Uuid,
        status: ScheduledActionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Cancel every pending action for a rule, returning how many were cancelled
    async fn cancel_scheduled_for_rule(&self, rule_id: &str) -> Result<u64, StoreError>;

    /// Return `Claimed` actions whose claim is older than `stale_threshold`
    /// to `Pending`; returns the reclaimed ids
    async fn reclaim_stale_scheduled_actions(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError>;
}

/// Claims taken at or before this instant are stale
pub(crate) fn stale_cutoff(stale_threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(stale_threshold)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn check_dlq_update(current: &DlqItem, next: &DlqItem) -> Result<(), StoreError> {
    if current.status != next.status && !current.status.can_transition_to(next.status) {
        return Err(StoreError::InvalidTransition {
            id: current.id,
            from: current.status.to_string(),
            to: next.status.to_string(),
        });
    }
    if current.status.is_terminal() {
        return Err(StoreError::InvalidTransition {
            id: current.id,
            from: current.status.to_string(),
            to: next.status.to_string(),
        });
    }
    if next.retry_attempts < current.retry_attempts {
        return Err(StoreError::InvalidTransition {
            id: current.id,
            from: format!("retry_attempts={}", current.retry_attempts),
            to: format!("retry_attempts={}", next.retry_attempts),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> DlqItem {
        let rule = Rule::new("r1", "Notify", "t1", "a1");
        DlqItem::from_failure(&rule, "boom", None, Parameters::new())
    }

    #[test]
    fn test_new_item_is_pending() {
        let item = item();
        assert_eq!(item.status, DlqStatus::Pending);
        assert_eq!(item.retry_attempts, 0);
        assert_eq!(item.rule_id, "r1");
        assert_eq!(item.action_id, "a1");
    }

    #[test]
    fn test_status_transitions() {
        use DlqStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Processed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Processed));
    }

    #[test]
    fn test_record_failure_reaches_ceiling() {
        let mut item = item();
        item.retry_attempts = 2;
        item.status = DlqStatus::Processing;
        item.record_failure(serde_json::json!({"success": false}), 3);
        assert_eq!(item.retry_attempts, 3);
        assert_eq!(item.status, DlqStatus::Failed);
    }

    #[test]
    fn test_record_failure_below_ceiling_stays_pending() {
        let mut item = item();
        item.status = DlqStatus::Processing;
        item.record_failure(serde_json::json!({"success": false}), 3);
        assert_eq!(item.retry_attempts, 1);
        assert_eq!(item.status, DlqStatus::Pending);
    }

    #[test]
    fn test_check_dlq_update_rejects_terminal_changes() {
        let mut current = item();
        current.status = DlqStatus::Processed;
        let mut next = current.clone();
        next.status = DlqStatus::Pending;
        assert!(matches!(
            check_dlq_update(&current, &next),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_check_dlq_update_rejects_decreasing_attempts() {
        let mut current = item();
        current.retry_attempts = 2;
        let mut next = current.clone();
        next.retry_attempts = 1;
        assert!(check_dlq_update(&current, &next).is_err());
    }

    #[test]
    fn test_batch_query_eligibility() {
        let query = DlqBatchQuery {
            limit: 10,
            older_than: None,
            ids: None,
            max_retry_attempts: 3,
        };
        let mut item = item();
        assert!(query.is_eligible(&item));

        item.retry_attempts = 3;
        assert!(!query.is_eligible(&item));

        item.retry_attempts = 0;
        item.status = DlqStatus::Failed;
        assert!(!query.is_eligible(&item));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(DlqStatus::parse("processed").unwrap(), DlqStatus::Processed);
        assert!(DlqStatus::parse("bogus").is_err());
        assert_eq!(
            ScheduledActionStatus::parse("cancelled").unwrap(),
            ScheduledActionStatus::Cancelled
        );
    }
}
