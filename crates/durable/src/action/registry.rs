//! Action registry

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ActionContext, ActionExecutionResult, ActionFailure, ActionHandler};
use crate::rule::Parameters;

/// Lookup table of action handlers by action id
///
/// # Example
///
/// ```
/// use triggerflow_durable::action::{ActionExecutionResult, ActionFailure, ActionRegistry};
///
/// let registry = ActionRegistry::new();
/// registry.register_fn("noop", |_ctx, _params| async move {
///     Ok::<_, ActionFailure>(ActionExecutionResult::ok("nothing to do"))
/// });
/// assert!(registry.contains("noop"));
/// ```
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `action_id`
    pub fn register(&self, action_id: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().insert(action_id.into(), handler);
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&self, action_id: impl Into<String>, handler: F)
    where
        F: Fn(ActionContext, Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionExecutionResult, ActionFailure>> + Send + 'static,
    {
        self.register(action_id, Arc::new(FnAction(handler)));
    }

    pub fn get(&self, action_id: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.read().get(action_id).cloned()
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.handlers.read().contains_key(action_id)
    }

    /// Registered ids, sorted
    pub fn action_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.handlers.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnAction<F>
where
    F: Fn(ActionContext, Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionExecutionResult, ActionFailure>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: &ActionContext,
        parameters: &Parameters,
    ) -> Result<ActionExecutionResult, ActionFailure> {
        (self.0)(ctx.clone(), parameters.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_fn_and_execute() {
        let registry = ActionRegistry::new();
        registry.register_fn("echo", |ctx, params| async move {
            Ok::<_, ActionFailure>(
                ActionExecutionResult::ok(format!("attempt {}", ctx.attempt))
                    .with_extra("params", serde_json::Value::Object(params)),
            )
        });

        let handler = registry.get("echo").unwrap();
        let mut params = Parameters::new();
        params.insert("x".into(), serde_json::json!(1));
        let result = handler
            .execute(&ActionContext::new("echo"), &params)
            .await
            .unwrap();

        assert_eq!(result.message, "attempt 1");
        assert_eq!(result.extra["params"]["x"], 1);
    }

    #[test]
    fn test_unknown_action() {
        let registry = ActionRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_action_ids_sorted() {
        let registry = ActionRegistry::new();
        for id in ["webhook", "email", "log"] {
            registry.register_fn(id, |_, _| async {
                Ok::<_, ActionFailure>(ActionExecutionResult::ok("ok"))
            });
        }
        assert_eq!(registry.action_ids(), vec!["email", "log", "webhook"]);
    }
}
