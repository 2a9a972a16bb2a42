//! Known trigger definitions

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A named event type that can start rule evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl TriggerDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Set of triggers the dispatcher accepts
#[derive(Default)]
pub struct TriggerRegistry {
    triggers: RwLock<HashMap<String, TriggerDefinition>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, trigger: TriggerDefinition) {
        self.triggers.write().insert(trigger.id.clone(), trigger);
    }

    pub fn get(&self, trigger_id: &str) -> Option<TriggerDefinition> {
        self.triggers.read().get(trigger_id).cloned()
    }

    pub fn contains(&self, trigger_id: &str) -> bool {
        self.triggers.read().contains_key(trigger_id)
    }

    /// All triggers, sorted by id
    pub fn triggers(&self) -> Vec<TriggerDefinition> {
        let mut triggers: Vec<_> = self.triggers.read().values().cloned().collect();
        triggers.sort_by(|a, b| a.id.cmp(&b.id));
        triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = TriggerRegistry::new();
        registry.register(
            TriggerDefinition::new("order_created", "Order created")
                .with_description("Fired when a checkout completes"),
        );

        assert!(registry.contains("order_created"));
        assert!(!registry.contains("order_shipped"));
        assert_eq!(registry.get("order_created").unwrap().name, "Order created");
    }

    #[test]
    fn test_deserialize_without_description() {
        let trigger: TriggerDefinition =
            serde_json::from_value(serde_json::json!({"id": "t1", "name": "T1"})).unwrap();
        assert!(trigger.description.is_empty());
    }
}
