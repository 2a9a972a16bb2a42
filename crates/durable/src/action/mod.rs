//! Actions and triggers
//!
//! An action is a named side-effecting operation (send email, call webhook).
//! Handlers implement [`ActionHandler`] and are looked up by id in an
//! [`ActionRegistry`]. Triggers are the named events that start rule
//! evaluation; known ids live in a [`TriggerRegistry`].

mod builtin;
mod registry;
mod trigger;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::rule::Parameters;

pub use builtin::{register_builtin_actions, LogMessageAction, WebhookAction};
pub use registry::ActionRegistry;
pub use trigger::{TriggerDefinition, TriggerRegistry};

/// Message fragments that mark a failure as permanent
const PERMANENT_FAILURE_MARKERS: &[&str] = &[
    "not found",
    "invalid parameter",
    "invalid input",
    "unauthorized",
    "forbidden",
];

/// Error type for action failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionFailure {
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Non-retryable failures stop the retry ladder immediately
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActionFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether retrying can plausibly help
    ///
    /// False for failures flagged non-retryable and for messages signalling
    /// a missing resource, bad input or a permission problem.
    pub fn is_transient(&self) -> bool {
        if !self.retryable {
            return false;
        }
        let message = self.message.to_lowercase();
        !PERMANENT_FAILURE_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionFailure {}

impl From<anyhow::Error> for ActionFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Per-attempt information handed to an action handler
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    pub action_id: String,

    /// Set for rule-driven invocations
    pub rule_id: Option<String>,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// True when replaying a dead-lettered invocation
    pub is_retry: bool,

    /// Caller-supplied context, e.g. the originating trigger payload
    pub context: Parameters,
}

impl ActionContext {
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            rule_id: None,
            attempt: 1,
            is_retry: false,
            context: Parameters::new(),
        }
    }

    /// Whether this is the first attempt
    pub fn is_first_attempt(&self) -> bool {
        self.attempt == 1
    }
}

/// Outcome of a successful action execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecutionResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub extra: Parameters,
}

impl ActionExecutionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            extra: Parameters::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A side-effecting operation a rule can invoke
///
/// Return [`ActionFailure::retryable`] for transient failures and
/// [`ActionFailure::non_retryable`] for permanent ones.
///
/// # Example
///
/// ```ignore
/// struct SendEmail;
///
/// #[async_trait]
/// impl ActionHandler for SendEmail {
///     async fn execute(
///         &self,
///         ctx: &ActionContext,
///         parameters: &Parameters,
///     ) -> Result<ActionExecutionResult, ActionFailure> {
///         let to = parameters
///             .get("to")
///             .and_then(|v| v.as_str())
///             .ok_or_else(|| ActionFailure::non_retryable("invalid parameter: to"))?;
///         // send...
///         Ok(ActionExecutionResult::ok(format!("sent to {}", to)))
///     }
/// }
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn execute(
        &self,
        ctx: &ActionContext,
        parameters: &Parameters,
    ) -> Result<ActionExecutionResult, ActionFailure>;
}
