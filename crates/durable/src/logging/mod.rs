//! Durable audit logging
//!
//! [`ErrorLogger`] writes [`LogEntry`] records to a [`LogSink`]. Writes are
//! best effort: a failing sink is reported through `tracing` and never
//! surfaces to the caller.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
pub use crate::persistence::{LogCategory, LogEntry, LogLevel, LogSink};

/// Best-effort writer for audit and error records
#[derive(Clone)]
pub struct ErrorLogger {
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for ErrorLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorLogger").finish_non_exhaustive()
    }
}

impl ErrorLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Persist a structured record of `error` and return its correlation id
    ///
    /// A fresh id is returned even when the sink rejects the write. Top-level
    /// keys of `details` are merged into the record's details; the reserved
    /// keys (`error_id`, `kind`, `context`, `error_context`, `stack_trace`)
    /// always hold the logger's values.
    pub async fn log_error(&self, error: &WorkflowError, context: &str, details: Value) -> Uuid {
        let error_id = Uuid::now_v7();

        let mut record = match details {
            Value::Object(extra) => extra,
            Value::Null => Map::new(),
            other => {
                let mut record = Map::new();
                record.insert("details".into(), other);
                record
            }
        };
        record.insert("error_id".into(), json!(error_id));
        record.insert("kind".into(), json!(error.kind().to_string()));
        record.insert("context".into(), json!(context));
        record.insert("error_context".into(), error.context());
        record.insert("stack_trace".into(), json!(format!("{:?}", error)));

        let mut entry = LogEntry::new(LogLevel::Error, LogCategory::Error, error.message())
            .with_details(Value::Object(record));
        entry.id = error_id;
        match error {
            WorkflowError::Trigger { trigger_id, .. } => entry.trigger_id = Some(trigger_id.clone()),
            WorkflowError::Action { action_id, .. } => entry.action_id = Some(action_id.clone()),
            WorkflowError::RuleEvaluation { rule_id, .. } => entry.rule_id = Some(rule_id.clone()),
            _ => {}
        }

        if let Err(sink_error) = self.sink.append(entry).await {
            error!(
                %error_id,
                kind = %error.kind(),
                context,
                original_error = %error,
                sink_error = %sink_error,
                "failed to persist error record"
            );
        }

        error_id
    }

    /// Append an audit entry, reporting sink failures through `tracing`
    pub async fn record(&self, entry: LogEntry) {
        let category = entry.category;
        let message = entry.message.clone();
        if let Err(e) = self.sink.append(entry).await {
            warn!(%category, %message, error = %e, "failed to persist log entry");
        }
    }
}
