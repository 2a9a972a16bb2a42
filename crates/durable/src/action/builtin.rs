//! Built-in actions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{ActionContext, ActionExecutionResult, ActionFailure, ActionHandler, ActionRegistry};
use crate::rule::Parameters;

/// Register `log_message` and `webhook`
pub fn register_builtin_actions(registry: &ActionRegistry) {
    registry.register("log_message", Arc::new(LogMessageAction));
    registry.register("webhook", Arc::new(WebhookAction::new()));
}

/// Writes its `message` parameter (and the rest of the parameters) to `tracing`
#[derive(Debug, Default)]
pub struct LogMessageAction;

#[async_trait]
impl ActionHandler for LogMessageAction {
    async fn execute(
        &self,
        ctx: &ActionContext,
        parameters: &Parameters,
    ) -> Result<ActionExecutionResult, ActionFailure> {
        let message = parameters
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("rule fired");

        let params = Value::Object(parameters.clone());
        info!(
            rule_id = ctx.rule_id.as_deref().unwrap_or("-"),
            parameters = %params,
            "{}",
            message
        );

        Ok(ActionExecutionResult::ok(format!("Logged: {}", message)))
    }
}

/// POSTs `{ parameters, context }` to the `url` parameter
///
/// 4xx responses are permanent failures; 5xx responses and network errors
/// are retryable.
#[derive(Debug, Clone)]
pub struct WebhookAction {
    client: reqwest::Client,
}

impl Default for WebhookAction {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookAction {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for WebhookAction {
    async fn execute(
        &self,
        ctx: &ActionContext,
        parameters: &Parameters,
    ) -> Result<ActionExecutionResult, ActionFailure> {
        let url = parameters
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                ActionFailure::non_retryable("invalid parameter: webhook requires a 'url'")
                    .with_type("configuration")
            })?;

        let mut request = self.client.post(url).json(&json!({
            "parameters": parameters,
            "context": ctx.context,
            "rule_id": ctx.rule_id,
            "attempt": ctx.attempt,
        }));

        if let Some(Value::Object(headers)) = parameters.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        debug!(url, attempt = ctx.attempt, "sending webhook");
        let response = request.send().await.map_err(|e| {
            ActionFailure::retryable(format!("webhook request failed: {}", e)).with_type("network")
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(ActionExecutionResult::ok(format!("Webhook delivered ({})", status))
                .with_extra("status_code", json!(status.as_u16())));
        }

        let body = response.text().await.unwrap_or_default();
        warn!(url, status = status.as_u16(), "webhook rejected");
        let failure = if status.is_client_error() {
            ActionFailure::non_retryable(format!("webhook rejected with {}", status))
                .with_type("http_client_error")
        } else {
            ActionFailure::retryable(format!("webhook failed with {}", status))
                .with_type("http_server_error")
        };
        Err(failure.with_details(json!({ "status_code": status.as_u16(), "body": body })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_message_action() {
        let mut params = Parameters::new();
        params.insert("message".into(), json!("hello"));

        let result = LogMessageAction
            .execute(&ActionContext::new("log_message"), &params)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.message, "Logged: hello");
    }

    #[tokio::test]
    async fn test_webhook_without_url_is_permanent() {
        let failure = WebhookAction::new()
            .execute(&ActionContext::new("webhook"), &Parameters::new())
            .await
            .unwrap_err();

        assert!(!failure.retryable);
        assert!(!failure.is_transient());
    }

    #[test]
    fn test_register_builtins() {
        let registry = ActionRegistry::new();
        register_builtin_actions(&registry);
        assert_eq!(registry.action_ids(), vec!["log_message", "webhook"]);
    }
}
