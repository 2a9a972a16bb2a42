//! PostgreSQL implementation of the storage traits
//!
//! - DLQ status changes are validated inside a row-locking transaction
//! - Delayed actions are claimed with `FOR UPDATE SKIP LOCKED`, so several
//!   pollers can share one table
//! - Claims older than a threshold are handed back to `pending`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::rule::{Condition, Parameters, Rule, Schedule};

/// Embedded schema migrations (`crates/durable/migrations`)
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL implementation of every store trait
///
/// # Example
///
/// ```ignore
/// use triggerflow_durable::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/triggerflow").await?;
/// let store = PostgresStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a default pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await.map_err(|e| {
            error!("Failed to run migrations: {}", e);
            StoreError::Database(e.to_string())
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RuleStore for PostgresStore {
    #[instrument(skip(self))]
    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, trigger_id, trigger_params, action_id, action_params,
                   schedule, delay_minutes, conditions, enabled
            FROM rules
            WHERE id = $1
            "#,
        )
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get rule: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(rule_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn enabled_rules_for_trigger(&self, trigger_id: &str) -> Result<Vec<Rule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, trigger_id, trigger_params, action_id, action_params,
                   schedule, delay_minutes, conditions, enabled
            FROM rules
            WHERE trigger_id = $1 AND enabled
            ORDER BY created_at, id
            "#,
        )
        .bind(trigger_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load rules for trigger: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(rule_from_row).collect()
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.id))]
    async fn save_rule(&self, rule: Rule) -> Result<(), StoreError> {
        let conditions = serde_json::to_value(&rule.conditions)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO rules (id, name, trigger_id, trigger_params, action_id, action_params,
                               schedule, delay_minutes, conditions, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                trigger_id = EXCLUDED.trigger_id,
                trigger_params = EXCLUDED.trigger_params,
                action_id = EXCLUDED.action_id,
                action_params = EXCLUDED.action_params,
                schedule = EXCLUDED.schedule,
                delay_minutes = EXCLUDED.delay_minutes,
                conditions = EXCLUDED.conditions,
                enabled = EXCLUDED.enabled,
                updated_at = NOW()
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(&rule.trigger_id)
        .bind(serde_json::Value::Object(rule.trigger_params.clone()))
        .bind(&rule.action_id)
        .bind(serde_json::Value::Object(rule.action_params.clone()))
        .bind(rule.schedule.to_string())
        .bind(db_int(rule.delay_minutes, "delay_minutes")?)
        .bind(conditions)
        .bind(rule.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save rule: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(rule_id = %rule.id, "saved rule");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_rule(&self, rule_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM rules WHERE id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete rule: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl LogSink for PostgresStore {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO logs (id, level, category, message, rule_id, trigger_id, action_id,
                              details, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.level.to_string())
        .bind(entry.category.to_string())
        .bind(&entry.message)
        .bind(&entry.rule_id)
        .bind(&entry.trigger_id)
        .bind(&entry.action_id)
        .bind(&entry.details)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }
}

const DLQ_COLUMNS: &str = "id, rule_id, rule_name, trigger_id, action_id, action_params, context, \
     error_message, stack_trace, status, retry_attempts, timestamp, last_processed_at, \
     processing_result, claimed_at";

#[async_trait]
impl DeadLetterStore for PostgresStore {
    #[instrument(skip(self, item), fields(dlq_id = %item.id, rule_id = %item.rule_id))]
    async fn enqueue_dlq_item(&self, item: DlqItem) -> Result<DlqItem, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (id, rule_id, rule_name, trigger_id, action_id,
                                           action_params, context, error_message, stack_trace,
                                           status, retry_attempts, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(item.id)
        .bind(&item.rule_id)
        .bind(&item.rule_name)
        .bind(&item.trigger_id)
        .bind(&item.action_id)
        .bind(serde_json::Value::Object(item.action_params.clone()))
        .bind(serde_json::Value::Object(item.context.clone()))
        .bind(&item.error_message)
        .bind(&item.stack_trace)
        .bind(item.status.as_str())
        .bind(db_int(item.retry_attempts, "retry_attempts")?)
        .bind(item.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue DLQ item: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(dlq_id = %item.id, "enqueued DLQ item");
        Ok(item)
    }

    #[instrument(skip(self))]
    async fn get_dlq_item(&self, id: Uuid) -> Result<Option<DlqItem>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM dead_letter_queue WHERE id = $1",
            DLQ_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get DLQ item: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(dlq_item_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_dlq_items(
        &self,
        filter: DlqFilter,
        pagination: Pagination,
    ) -> Result<Vec<DlqItem>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM dead_letter_queue
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR rule_id = $2)
              AND ($3::text IS NULL OR action_id = $3)
            ORDER BY timestamp DESC, id DESC
            OFFSET $4
            LIMIT $5
            "#,
            DLQ_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.rule_id)
        .bind(&filter.action_id)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list DLQ: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(dlq_item_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn select_dlq_batch(&self, query: &DlqBatchQuery) -> Result<Vec<DlqItem>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM dead_letter_queue
            WHERE status = 'pending'
              AND retry_attempts < $1
              AND ($2::timestamptz IS NULL OR timestamp < $2)
              AND ($3::uuid[] IS NULL OR id = ANY($3))
            ORDER BY timestamp ASC, id ASC
            LIMIT $4
            "#,
            DLQ_COLUMNS
        ))
        // INTEGER column; saturate so u32::MAX still admits every row
        .bind(i32::try_from(query.max_retry_attempts).unwrap_or(i32::MAX))
        .bind(query.older_than)
        .bind(query.ids.clone())
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to select DLQ batch: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(dlq_item_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn begin_dlq_processing(&self, id: Uuid) -> Result<DlqItem, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE dead_letter_queue
            SET status = 'processing', claimed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            DLQ_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark DLQ item processing: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => dlq_item_from_row(&row),
            None => {
                let current = self
                    .get_dlq_item(id)
                    .await?
                    .ok_or(StoreError::DlqItemNotFound(id))?;
                Err(StoreError::InvalidTransition {
                    id,
                    from: current.status.to_string(),
                    to: DlqStatus::Processing.to_string(),
                })
            }
        }
    }

    #[instrument(skip(self, item), fields(dlq_id = %item.id, status = %item.status))]
    async fn save_dlq_item(&self, item: &DlqItem) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM dead_letter_queue WHERE id = $1 FOR UPDATE",
            DLQ_COLUMNS
        ))
        .bind(item.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to lock DLQ item: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::DlqItemNotFound(item.id))?;

        let current = dlq_item_from_row(&row)?;
        check_dlq_update(&current, item)?;

        sqlx::query(
            r#"
            UPDATE dead_letter_queue
            SET status = $2,
                retry_attempts = $3,
                last_processed_at = $4,
                processing_result = $5,
                error_message = $6,
                claimed_at = $7
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(item.status.as_str())
        .bind(db_int(item.retry_attempts, "retry_attempts")?)
        .bind(item.last_processed_at)
        .bind(&item.processing_result)
        .bind(&item.error_message)
        .bind(item.claimed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to update DLQ item: {}", e);
            StoreError::Database(e.to_string())
        })?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(dlq_id = %item.id, status = %item.status, "updated DLQ item");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_dlq_items(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE dead_letter_queue
            SET status = 'pending',
                claimed_at = NULL
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at <= $1)
            RETURNING id
            "#,
        )
        .bind(stale_cutoff(stale_threshold))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reclaim stale DLQ items: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale DLQ items");
        }
        Ok(reclaimed)
    }

    #[instrument(skip(self))]
    async fn delete_dlq_item(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM dead_letter_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete DLQ item: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn dlq_stats(&self) -> Result<DlqStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM dead_letter_queue
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load DLQ stats: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut stats = DlqStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count = row.get::<i64, _>("count") as u64;
            match DlqStatus::parse(&status)? {
                DlqStatus::Pending => stats.pending = count,
                DlqStatus::Processing => stats.processing = count,
                DlqStatus::Processed => stats.processed = count,
                DlqStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

const SCHEDULED_COLUMNS: &str =
    "id, rule_id, trigger_id, parameters, run_at, status, created_at, completed_at, error, claimed_at";

#[async_trait]
impl ScheduledActionStore for PostgresStore {
    #[instrument(skip(self, action), fields(job_id = %action.id, rule_id = %action.rule_id))]
    async fn schedule_action(&self, action: ScheduledAction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_actions (id, rule_id, trigger_id, parameters, run_at, status,
                                           created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(action.id)
        .bind(&action.rule_id)
        .bind(&action.trigger_id)
        .bind(serde_json::Value::Object(action.parameters.clone()))
        .bind(action.run_at)
        .bind(action.status.as_str())
        .bind(action.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to schedule action: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(job_id = %action.id, run_at = %action.run_at, "scheduled action");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_scheduled_action(&self, id: Uuid) -> Result<Option<ScheduledAction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_actions WHERE id = $1",
            SCHEDULED_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get scheduled action: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(scheduled_action_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn claim_scheduled_action(
        &self,
        id: Uuid,
    ) -> Result<Option<ScheduledAction>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE scheduled_actions
            SET status = 'claimed', claimed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            SCHEDULED_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim scheduled action: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => scheduled_action_from_row(&row).map(Some),
            None => match self.get_scheduled_action(id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::ScheduledActionNotFound(id)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledAction>, StoreError> {
        // SKIP LOCKED lets concurrent pollers claim disjoint batches
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM scheduled_actions
                WHERE status = 'pending' AND run_at <= $1
                ORDER BY run_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scheduled_actions s
            SET status = 'claimed', claimed_at = NOW()
            FROM due
            WHERE s.id = due.id
            RETURNING s.id, s.rule_id, s.trigger_id, s.parameters, s.run_at, s.status,
                      s.created_at, s.completed_at, s.error, s.claimed_at
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim due actions: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut claimed = rows
            .iter()
            .map(scheduled_action_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due actions");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, error))]
    async fn finish_scheduled_action(
        &self,
        id: Uuid,
        status: ScheduledActionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = $2, error = $3, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to finish scheduled action: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ScheduledActionNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_scheduled_for_rule(&self, rule_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'cancelled', completed_at = NOW()
            WHERE rule_id = $1 AND status = 'pending'
            "#,
        )
        .bind(rule_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to cancel scheduled actions: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_scheduled_actions(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'pending',
                claimed_at = NULL
            WHERE status = 'claimed'
              AND (claimed_at IS NULL OR claimed_at <= $1)
            RETURNING id
            "#,
        )
        .bind(stale_cutoff(stale_threshold))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reclaim stale scheduled actions: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale scheduled actions");
        }
        Ok(reclaimed)
    }
}

// Helper functions

/// Counters are INTEGER columns
fn db_int(value: u32, field: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| {
        StoreError::Serialization(format!("{} out of range for storage: {}", field, value))
    })
}

fn json_object(value: serde_json::Value) -> Parameters {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Parameters::new(),
    }
}

fn rule_from_row(row: &PgRow) -> Result<Rule, StoreError> {
    let schedule = match row.get::<String, _>("schedule").as_str() {
        "immediate" => Schedule::Immediate,
        "delayed" => Schedule::Delayed,
        other => {
            return Err(StoreError::Serialization(format!(
                "unknown rule schedule: {}",
                other
            )))
        }
    };
    let conditions: Vec<Condition> = serde_json::from_value(row.get("conditions"))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Rule {
        id: row.get("id"),
        name: row.get("name"),
        trigger_id: row.get("trigger_id"),
        trigger_params: json_object(row.get("trigger_params")),
        action_id: row.get("action_id"),
        action_params: json_object(row.get("action_params")),
        schedule,
        delay_minutes: row.get::<i32, _>("delay_minutes").max(0) as u32,
        conditions,
        enabled: row.get("enabled"),
    })
}

fn dlq_item_from_row(row: &PgRow) -> Result<DlqItem, StoreError> {
    let status: String = row.get("status");
    Ok(DlqItem {
        id: row.get("id"),
        rule_id: row.get("rule_id"),
        rule_name: row.get("rule_name"),
        trigger_id: row.get("trigger_id"),
        action_id: row.get("action_id"),
        action_params: json_object(row.get("action_params")),
        context: json_object(row.get("context")),
        error_message: row.get("error_message"),
        stack_trace: row.get("stack_trace"),
        status: DlqStatus::parse(&status)?,
        retry_attempts: row.get::<i32, _>("retry_attempts").max(0) as u32,
        timestamp: row.get("timestamp"),
        last_processed_at: row.get("last_processed_at"),
        processing_result: row.get("processing_result"),
        claimed_at: row.get("claimed_at"),
    })
}

fn scheduled_action_from_row(row: &PgRow) -> Result<ScheduledAction, StoreError> {
    let status: String = row.get("status");
    Ok(ScheduledAction {
        id: row.get("id"),
        rule_id: row.get("rule_id"),
        trigger_id: row.get("trigger_id"),
        parameters: json_object(row.get("parameters")),
        run_at: row.get("run_at"),
        status: ScheduledActionStatus::parse(&status)?,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        error: row.get("error"),
        claimed_at: row.get("claimed_at"),
    })
}
