//! Startup data: known triggers and seed rules
//!
//! ```json
//! {
//!   "triggers": [{ "id": "order_created", "name": "Order created" }],
//!   "rules": [{
//!     "id": "notify-ops",
//!     "name": "Notify ops",
//!     "trigger_id": "order_created",
//!     "action_id": "webhook",
//!     "action_params": { "url": "https://example.com/hook" }
//!   }]
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use triggerflow_durable::action::{TriggerDefinition, TriggerRegistry};
use triggerflow_durable::persistence::RuleStore;
use triggerflow_durable::rule::Rule;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Bootstrap {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid bootstrap document")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("in {}", path.display()))
    }

    /// Register the triggers and upsert the rules
    ///
    /// Rules naming an unregistered trigger are still saved, with a warning.
    pub async fn apply(&self, triggers: &TriggerRegistry, rules: &dyn RuleStore) -> Result<()> {
        for trigger in &self.triggers {
            triggers.register(trigger.clone());
        }

        for rule in &self.rules {
            if !triggers.contains(&rule.trigger_id) {
                warn!(rule_id = %rule.id, trigger_id = %rule.trigger_id, "rule references unknown trigger");
            }
            rules
                .save_rule(rule.clone())
                .await
                .with_context(|| format!("failed to save rule {}", rule.id))?;
        }

        info!(
            triggers = self.triggers.len(),
            rules = self.rules.len(),
            "bootstrap applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triggerflow_durable::InMemoryStore;

    #[tokio::test]
    async fn test_apply_registers_triggers_and_rules() {
        let bootstrap = Bootstrap::from_json(
            r#"{
                "triggers": [{"id": "order_created", "name": "Order created"}],
                "rules": [{
                    "id": "r1",
                    "name": "Notify",
                    "trigger_id": "order_created",
                    "action_id": "log_message",
                    "schedule": "delayed",
                    "delay_minutes": 10
                }]
            }"#,
        )
        .unwrap();

        let triggers = TriggerRegistry::new();
        let store = InMemoryStore::new();
        bootstrap.apply(&triggers, &store).await.unwrap();

        assert!(triggers.contains("order_created"));
        let rule = store.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(rule.delay_minutes, 10);
        assert!(rule.enabled);
    }

    #[test]
    fn test_rejects_malformed_document() {
        assert!(Bootstrap::from_json(r#"{"rules": [{"id": 1}]}"#).is_err());
    }
}
