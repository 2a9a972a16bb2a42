//! In-memory implementation of the storage traits for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::rule::Rule;

/// In-memory implementation of every store trait
///
/// This is primarily for testing. It keeps all data in memory and provides
/// the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use triggerflow_durable::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.dlq_count(), 0);
/// ```
pub struct InMemoryStore {
    /// Insertion-ordered so dispatch order is deterministic
    rules: RwLock<Vec<Rule>>,
    logs: RwLock<Vec<LogEntry>>,
    dlq: RwLock<HashMap<Uuid, DlqItem>>,
    scheduled: RwLock<HashMap<Uuid, ScheduledAction>>,
    fail_log_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            logs: RwLock::new(Vec::new()),
            dlq: RwLock::new(HashMap::new()),
            scheduled: RwLock::new(HashMap::new()),
            fail_log_writes: AtomicBool::new(false),
        }
    }

    /// Seed rules (replacing any with the same id)
    pub fn with_rules(self, rules: impl IntoIterator<Item = Rule>) -> Self {
        for rule in rules {
            self.upsert_rule(rule);
        }
        self
    }

    fn upsert_rule(&self, rule: Rule) {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    /// Make subsequent log appends fail (for testing fallback paths)
    pub fn set_log_failure(&self, fail: bool) {
        self.fail_log_writes.store(fail, Ordering::SeqCst);
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.read().clone()
    }

    pub fn logs_in_category(&self, category: LogCategory) -> Vec<LogEntry> {
        self.logs
            .read()
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// All DLQ items, oldest first
    pub fn dlq_items(&self) -> Vec<DlqItem> {
        let mut items: Vec<_> = self.dlq.read().values().cloned().collect();
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        items
    }

    pub fn dlq_count(&self) -> usize {
        self.dlq.read().len()
    }

    pub fn scheduled_actions(&self) -> Vec<ScheduledAction> {
        let mut actions: Vec<_> = self.scheduled.read().values().cloned().collect();
        actions.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));
        actions
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.rules.write().clear();
        self.logs.write().clear();
        self.dlq.write().clear();
        self.scheduled.write().clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, StoreError> {
        Ok(self.rules.read().iter().find(|r| r.id == rule_id).cloned())
    }

    async fn enabled_rules_for_trigger(&self, trigger_id: &str) -> Result<Vec<Rule>, StoreError> {
        Ok(self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled && r.trigger_id == trigger_id)
            .cloned()
            .collect())
    }

    async fn save_rule(&self, rule: Rule) -> Result<(), StoreError> {
        self.upsert_rule(rule);
        Ok(())
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<bool, StoreError> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        Ok(rules.len() != before)
    }
}

#[async_trait]
impl LogSink for InMemoryStore {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        if self.fail_log_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("log sink unavailable".to_string()));
        }
        self.logs.write().push(entry);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn enqueue_dlq_item(&self, item: DlqItem) -> Result<DlqItem, StoreError> {
        self.dlq.write().insert(item.id, item.clone());
        Ok(item)
    }

    async fn get_dlq_item(&self, id: Uuid) -> Result<Option<DlqItem>, StoreError> {
        Ok(self.dlq.read().get(&id).cloned())
    }

    async fn list_dlq_items(
        &self,
        filter: DlqFilter,
        pagination: Pagination,
    ) -> Result<Vec<DlqItem>, StoreError> {
        let mut items: Vec<_> = self
            .dlq
            .read()
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        Ok(items
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn select_dlq_batch(&self, query: &DlqBatchQuery) -> Result<Vec<DlqItem>, StoreError> {
        let mut items: Vec<_> = self
            .dlq
            .read()
            .values()
            .filter(|item| query.is_eligible(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        items.truncate(query.limit as usize);
        Ok(items)
    }

    async fn begin_dlq_processing(&self, id: Uuid) -> Result<DlqItem, StoreError> {
        let mut dlq = self.dlq.write();
        let item = dlq.get_mut(&id).ok_or(StoreError::DlqItemNotFound(id))?;

        if item.status != DlqStatus::Pending {
            return Err(StoreError::InvalidTransition {
                id,
                from: item.status.to_string(),
                to: DlqStatus::Processing.to_string(),
            });
        }

        item.status = DlqStatus::Processing;
        item.claimed_at = Some(Utc::now());
        Ok(item.clone())
    }

    async fn save_dlq_item(&self, item: &DlqItem) -> Result<(), StoreError> {
        let mut dlq = self.dlq.write();
        let current = dlq
            .get_mut(&item.id)
            .ok_or(StoreError::DlqItemNotFound(item.id))?;

        check_dlq_update(current, item)?;
        *current = item.clone();
        Ok(())
    }

    async fn reclaim_stale_dlq_items(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = stale_cutoff(stale_threshold);
        let mut reclaimed = Vec::new();
        for item in self.dlq.write().values_mut() {
            if item.status == DlqStatus::Processing
                && item.claimed_at.map_or(true, |at| at <= cutoff)
            {
                item.status = DlqStatus::Pending;
                item.claimed_at = None;
                reclaimed.push(item.id);
            }
        }
        Ok(reclaimed)
    }

    async fn delete_dlq_item(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.dlq.write().remove(&id).is_some())
    }

    async fn dlq_stats(&self) -> Result<DlqStats, StoreError> {
        let mut stats = DlqStats::default();
        for item in self.dlq.read().values() {
            match item.status {
                DlqStatus::Pending => stats.pending += 1,
                DlqStatus::Processing => stats.processing += 1,
                DlqStatus::Processed => stats.processed += 1,
                DlqStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl ScheduledActionStore for InMemoryStore {
    async fn schedule_action(&self, action: ScheduledAction) -> Result<(), StoreError> {
        self.scheduled.write().insert(action.id, action);
        Ok(())
    }

    async fn get_scheduled_action(&self, id: Uuid) -> Result<Option<ScheduledAction>, StoreError> {
        Ok(self.scheduled.read().get(&id).cloned())
    }

    async fn claim_scheduled_action(
        &self,
        id: Uuid,
    ) -> Result<Option<ScheduledAction>, StoreError> {
        let mut scheduled = self.scheduled.write();
        let action = scheduled
            .get_mut(&id)
            .ok_or(StoreError::ScheduledActionNotFound(id))?;

        if action.status != ScheduledActionStatus::Pending {
            return Ok(None);
        }
        action.status = ScheduledActionStatus::Claimed;
        action.claimed_at = Some(Utc::now());
        Ok(Some(action.clone()))
    }

    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledAction>, StoreError> {
        let mut scheduled = self.scheduled.write();
        let mut due: Vec<_> = scheduled
            .values()
            .filter(|a| a.status == ScheduledActionStatus::Pending && a.run_at <= now)
            .map(|a| (a.run_at, a.id))
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let claimed_at = Utc::now();
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(action) = scheduled.get_mut(&id) {
                action.status = ScheduledActionStatus::Claimed;
                action.claimed_at = Some(claimed_at);
                claimed.push(action.clone());
            }
        }
        Ok(claimed)
    }

    async fn finish_scheduled_action(
        &self,
        id: Uuid,
        status: ScheduledActionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut scheduled = self.scheduled.write();
        let action = scheduled
            .get_mut(&id)
            .ok_or(StoreError::ScheduledActionNotFound(id))?;

        action.status = status;
        action.error = error;
        action.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel_scheduled_for_rule(&self, rule_id: &str) -> Result<u64, StoreError> {
        let mut cancelled = 0;
        for action in self.scheduled.write().values_mut() {
            if action.rule_id == rule_id && action.status == ScheduledActionStatus::Pending {
                action.status = ScheduledActionStatus::Cancelled;
                action.completed_at = Some(Utc::now());
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn reclaim_stale_scheduled_actions(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = stale_cutoff(stale_threshold);
        let mut reclaimed = Vec::new();
        for action in self.scheduled.write().values_mut() {
            if action.status == ScheduledActionStatus::Claimed
                && action.claimed_at.map_or(true, |at| at <= cutoff)
            {
                action.status = ScheduledActionStatus::Pending;
                action.claimed_at = None;
                reclaimed.push(action.id);
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Parameters;
    use chrono::Duration;

    fn dlq_item_at(rule: &Rule, timestamp: DateTime<Utc>) -> DlqItem {
        let mut item = DlqItem::from_failure(rule, "boom", None, Parameters::new());
        item.timestamp = timestamp;
        item
    }

    #[tokio::test]
    async fn test_enabled_rules_for_trigger() {
        let store = InMemoryStore::new().with_rules([
            Rule::new("r1", "a", "t1", "x"),
            Rule::new("r2", "b", "t1", "x").disabled(),
            Rule::new("r3", "c", "t2", "x"),
        ]);

        let rules = store.enabled_rules_for_trigger("t1").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r1");
    }

    #[tokio::test]
    async fn test_save_rule_replaces_in_place() {
        let store = InMemoryStore::new().with_rules([
            Rule::new("r1", "first", "t1", "x"),
            Rule::new("r2", "second", "t1", "x"),
        ]);
        store
            .save_rule(Rule::new("r1", "renamed", "t1", "x"))
            .await
            .unwrap();

        let rules = store.enabled_rules_for_trigger("t1").await.unwrap();
        assert_eq!(rules[0].name, "renamed");
        assert_eq!(rules[1].id, "r2");
        assert!(store.delete_rule("r2").await.unwrap());
        assert!(!store.delete_rule("r2").await.unwrap());
    }

    #[tokio::test]
    async fn test_select_batch_is_fifo() {
        let store = InMemoryStore::new();
        let rule = Rule::new("r1", "n", "t1", "a1");
        let now = Utc::now();

        let t3 = dlq_item_at(&rule, now - Duration::minutes(1));
        let t1 = dlq_item_at(&rule, now - Duration::minutes(30));
        let t2 = dlq_item_at(&rule, now - Duration::minutes(10));
        for item in [&t3, &t1, &t2] {
            store.enqueue_dlq_item(item.clone()).await.unwrap();
        }

        let batch = store
            .select_dlq_batch(&DlqBatchQuery {
                limit: 2,
                older_than: None,
                ids: None,
                max_retry_attempts: 3,
            })
            .await
            .unwrap();

        assert_eq!(
            batch.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![t1.id, t2.id]
        );
    }

    #[tokio::test]
    async fn test_begin_processing_only_from_pending() {
        let store = InMemoryStore::new();
        let rule = Rule::new("r1", "n", "t1", "a1");
        let item = store
            .enqueue_dlq_item(DlqItem::from_failure(&rule, "boom", None, Parameters::new()))
            .await
            .unwrap();

        let processing = store.begin_dlq_processing(item.id).await.unwrap();
        assert_eq!(processing.status, DlqStatus::Processing);

        let again = store.begin_dlq_processing(item.id).await;
        assert!(matches!(again, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_save_rejects_backwards_transition() {
        let store = InMemoryStore::new();
        let rule = Rule::new("r1", "n", "t1", "a1");
        let item = store
            .enqueue_dlq_item(DlqItem::from_failure(&rule, "boom", None, Parameters::new()))
            .await
            .unwrap();

        let mut processing = store.begin_dlq_processing(item.id).await.unwrap();
        processing.record_success(serde_json::json!({"success": true}));
        store.save_dlq_item(&processing).await.unwrap();

        let mut reopened = processing.clone();
        reopened.status = DlqStatus::Pending;
        assert!(store.save_dlq_item(&reopened).await.is_err());

        let stats = store.dlq_stats().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_claim_scheduled_action_once() {
        let store = InMemoryStore::new();
        let rule = Rule::new("r1", "n", "t1", "a1").delayed(5);
        let action = ScheduledAction::new(&rule, Parameters::new(), Utc::now());
        store.schedule_action(action.clone()).await.unwrap();

        assert!(store.claim_scheduled_action(action.id).await.unwrap().is_some());
        assert!(store.claim_scheduled_action(action.id).await.unwrap().is_none());
        assert!(store.claim_due_actions(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_due_actions_respects_run_at() {
        let store = InMemoryStore::new();
        let rule = Rule::new("r1", "n", "t1", "a1").delayed(5);
        let now = Utc::now();
        let due = ScheduledAction::new(&rule, Parameters::new(), now - Duration::seconds(1));
        let later = ScheduledAction::new(&rule, Parameters::new(), now + Duration::minutes(5));
        store.schedule_action(due.clone()).await.unwrap();
        store.schedule_action(later.clone()).await.unwrap();

        let claimed = store.claim_due_actions(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);

        assert_eq!(store.cancel_scheduled_for_rule("r1").await.unwrap(), 1);
        let later = store.get_scheduled_action(later.id).await.unwrap().unwrap();
        assert_eq!(later.status, ScheduledActionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reclaim_stale_dlq_items_keeps_attempts() {
        let store = InMemoryStore::new();
        let rule = Rule::new("r1", "n", "t1", "a1");
        let mut item = DlqItem::from_failure(&rule, "boom", None, Parameters::new());
        item.retry_attempts = 2;
        let item = store.enqueue_dlq_item(item).await.unwrap();

        let claimed = store.begin_dlq_processing(item.id).await.unwrap();
        assert!(claimed.claimed_at.is_some());

        // a fresh claim is left alone
        let reclaimed = store
            .reclaim_stale_dlq_items(std::time::Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        let reclaimed = store.reclaim_stale_dlq_items(std::time::Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed, vec![item.id]);

        let stored = store.get_dlq_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DlqStatus::Pending);
        assert_eq!(stored.retry_attempts, 2);
        assert!(stored.claimed_at.is_none());

        let batch = store
            .select_dlq_batch(&DlqBatchQuery {
                limit: 10,
                older_than: None,
                ids: None,
                max_retry_attempts: 3,
            })
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_skips_finished_dlq_items() {
        let store = InMemoryStore::new();
        let rule = Rule::new("r1", "n", "t1", "a1");
        let item = store
            .enqueue_dlq_item(DlqItem::from_failure(&rule, "boom", None, Parameters::new()))
            .await
            .unwrap();

        let mut processing = store.begin_dlq_processing(item.id).await.unwrap();
        processing.record_success(serde_json::json!({"success": true}));
        store.save_dlq_item(&processing).await.unwrap();

        assert!(store
            .reclaim_stale_dlq_items(std::time::Duration::ZERO)
            .await
            .unwrap()
            .is_empty());
        let stored = store.get_dlq_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DlqStatus::Processed);
    }

    #[tokio::test]
    async fn test_reclaim_stale_scheduled_actions() {
        let store = InMemoryStore::new();
        let rule = Rule::new("r1", "n", "t1", "a1").delayed(5);
        let now = Utc::now();
        let job = ScheduledAction::new(&rule, Parameters::new(), now - Duration::seconds(1));
        store.schedule_action(job.clone()).await.unwrap();

        assert_eq!(store.claim_due_actions(now, 10).await.unwrap().len(), 1);
        assert!(store.claim_due_actions(now, 10).await.unwrap().is_empty());

        let reclaimed = store
            .reclaim_stale_scheduled_actions(std::time::Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![job.id]);

        let stored = store.get_scheduled_action(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduledActionStatus::Pending);
        assert!(stored.claimed_at.is_none());
        assert_eq!(store.claim_due_actions(Utc::now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_log_failure_switch() {
        let store = InMemoryStore::new();
        store.set_log_failure(true);
        let result = store
            .append(LogEntry::info(LogCategory::Dispatch, "hello"))
            .await;
        assert!(result.is_err());
        assert!(store.logs().is_empty());
    }
}
