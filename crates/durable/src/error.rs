//! Workflow error taxonomy
//!
//! Every failure surfaced by the engine is a [`WorkflowError`]. Each variant
//! carries a human message plus the context fields specific to its kind, so
//! callers match on the variant instead of inspecting strings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::StoreError;

/// Discriminant of a [`WorkflowError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Trigger,
    Action,
    RuleEvaluation,
    Scheduling,
    Configuration,
    Database,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trigger => write!(f, "trigger_error"),
            Self::Action => write!(f, "action_error"),
            Self::RuleEvaluation => write!(f, "rule_evaluation_error"),
            Self::Scheduling => write!(f, "scheduling_error"),
            Self::Configuration => write!(f, "configuration_error"),
            Self::Database => write!(f, "database_error"),
        }
    }
}

/// Errors raised by the rule engine
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowError {
    /// Unknown trigger or trigger-level failure
    #[error("{message}")]
    Trigger { message: String, trigger_id: String },

    /// Action could not be executed
    #[error("{message}")]
    Action {
        message: String,
        action_id: String,
        parameters: serde_json::Value,
    },

    /// Condition evaluation failed for a rule
    #[error("{message}")]
    RuleEvaluation { message: String, rule_id: String },

    /// Delay or dispatch bookkeeping failed
    #[error("{message}")]
    Scheduling { message: String },

    /// Missing or invalid configuration (unknown action, missing rule, ...)
    #[error("{message}")]
    Configuration { message: String },

    /// Persistence of rules, logs or DLQ rows failed
    #[error("{message}")]
    Database {
        message: String,
        cause: Option<String>,
    },
}

impl WorkflowError {
    pub fn trigger(trigger_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Trigger {
            message: message.into(),
            trigger_id: trigger_id.into(),
        }
    }

    pub fn action(
        action_id: impl Into<String>,
        parameters: serde_json::Value,
        message: impl Into<String>,
    ) -> Self {
        Self::Action {
            message: message.into(),
            action_id: action_id.into(),
            parameters,
        }
    }

    pub fn rule_evaluation(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RuleEvaluation {
            message: message.into(),
            rule_id: rule_id.into(),
        }
    }

    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>, cause: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            cause,
        }
    }

    /// Kind discriminant
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Trigger { .. } => ErrorKind::Trigger,
            Self::Action { .. } => ErrorKind::Action,
            Self::RuleEvaluation { .. } => ErrorKind::RuleEvaluation,
            Self::Scheduling { .. } => ErrorKind::Scheduling,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Database { .. } => ErrorKind::Database,
        }
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        match self {
            Self::Trigger { message, .. }
            | Self::Action { message, .. }
            | Self::RuleEvaluation { message, .. }
            | Self::Scheduling { message }
            | Self::Configuration { message }
            | Self::Database { message, .. } => message,
        }
    }

    fn message_mut(&mut self) -> &mut String {
        match self {
            Self::Trigger { message, .. }
            | Self::Action { message, .. }
            | Self::RuleEvaluation { message, .. }
            | Self::Scheduling { message }
            | Self::Configuration { message }
            | Self::Database { message, .. } => message,
        }
    }

    /// Kind-specific context fields as JSON (message excluded)
    pub fn context(&self) -> serde_json::Value {
        match self {
            Self::Trigger { trigger_id, .. } => serde_json::json!({ "trigger_id": trigger_id }),
            Self::Action {
                action_id,
                parameters,
                ..
            } => serde_json::json!({ "action_id": action_id, "parameters": parameters }),
            Self::RuleEvaluation { rule_id, .. } => serde_json::json!({ "rule_id": rule_id }),
            Self::Scheduling { .. } | Self::Configuration { .. } => serde_json::json!({}),
            Self::Database { cause, .. } => serde_json::json!({ "cause": cause }),
        }
    }

    /// Append the `(Error ID: <id>)` correlation suffix to the message
    pub fn with_error_id(mut self, error_id: Uuid) -> Self {
        let message = self.message_mut();
        message.push_str(&format!(" (Error ID: {})", error_id));
        self
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        Self::database(format!("storage operation failed: {}", err), Some(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(WorkflowError::trigger("t1", "x").kind(), ErrorKind::Trigger);
        assert_eq!(
            WorkflowError::action("a1", serde_json::json!({}), "x").kind(),
            ErrorKind::Action
        );
        assert_eq!(
            WorkflowError::rule_evaluation("r1", "x").kind(),
            ErrorKind::RuleEvaluation
        );
        assert_eq!(WorkflowError::scheduling("x").kind(), ErrorKind::Scheduling);
        assert_eq!(
            WorkflowError::configuration("x").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(WorkflowError::database("x", None).kind(), ErrorKind::Database);
    }

    #[test]
    fn test_error_id_suffix() {
        let id = Uuid::now_v7();
        let err = WorkflowError::action("send_email", serde_json::json!({}), "smtp down")
            .with_error_id(id);

        assert_eq!(err.to_string(), format!("smtp down (Error ID: {})", id));
        assert!(matches!(err, WorkflowError::Action { ref action_id, .. } if action_id == "send_email"));
    }

    #[test]
    fn test_store_error_becomes_database_error() {
        let err: WorkflowError = StoreError::Database("connection reset".into()).into();
        assert_eq!(err.kind(), ErrorKind::Database);
        assert!(err.message().contains("connection reset"));
    }

    #[test]
    fn test_serialization_is_tagged() {
        let err = WorkflowError::trigger("order_created", "unknown trigger");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "trigger");
        assert_eq!(json["trigger_id"], "order_created");

        let parsed: WorkflowError = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::RuleEvaluation.to_string(), "rule_evaluation_error");
        assert_eq!(ErrorKind::Database.to_string(), "database_error");
    }
}
