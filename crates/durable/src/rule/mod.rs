//! Rules binding a trigger to an action
//!
//! Rules are owned by the rule store and never mutated by the engine. A
//! dispatch works on the copy fetched for it.

mod condition;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use condition::{evaluate_all, Condition, ConditionError, ConditionOperator, ConditionValue};

/// Arbitrary key-value parameter bag
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// When a matched rule's action runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    #[default]
    Immediate,
    Delayed,
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Delayed => write!(f, "delayed"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A binding from one trigger to one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub trigger_id: String,
    #[serde(default)]
    pub trigger_params: Parameters,
    pub action_id: String,
    #[serde(default)]
    pub action_params: Parameters,
    #[serde(default)]
    pub schedule: Schedule,
    /// Only meaningful for [`Schedule::Delayed`]
    #[serde(default)]
    pub delay_minutes: u32,
    /// Combined with logical AND
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Rule {
    /// Create an enabled, immediate rule with no parameters or conditions
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        trigger_id: impl Into<String>,
        action_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            trigger_id: trigger_id.into(),
            trigger_params: Parameters::new(),
            action_id: action_id.into(),
            action_params: Parameters::new(),
            schedule: Schedule::Immediate,
            delay_minutes: 0,
            conditions: Vec::new(),
            enabled: true,
        }
    }

    /// Set action parameters from a JSON object (non-objects are ignored)
    pub fn with_action_params(mut self, params: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = params {
            self.action_params = map;
        }
        self
    }

    pub fn with_trigger_params(mut self, params: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = params {
            self.trigger_params = map;
        }
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Run the action `minutes` after dispatch
    pub fn delayed(mut self, minutes: u32) -> Self {
        self.schedule = Schedule::Delayed;
        self.delay_minutes = minutes;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.delay_minutes) * 60)
    }

    /// Whether every condition holds for `parameters`
    pub fn matches(&self, parameters: &Parameters) -> Result<bool, ConditionError> {
        evaluate_all(&self.conditions, parameters)
    }

    pub fn reference(&self) -> RuleRef {
        RuleRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Lightweight identifier for a rule in results and logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRef {
    pub id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_defaults() {
        let rule = Rule::new("r1", "Notify", "order_created", "send_email");
        assert!(rule.enabled);
        assert_eq!(rule.schedule, Schedule::Immediate);
        assert!(rule.conditions.is_empty());
        assert!(rule.matches(&Parameters::new()).unwrap());
    }

    #[test]
    fn test_delayed_rule() {
        let rule = Rule::new("r1", "Follow up", "t1", "a1").delayed(15);
        assert_eq!(rule.schedule, Schedule::Delayed);
        assert_eq!(rule.delay(), Duration::from_secs(900));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let rule: Rule = serde_json::from_value(json!({
            "id": "r1",
            "name": "Big orders",
            "trigger_id": "order_created",
            "action_id": "webhook",
            "conditions": [
                {"field": "amount", "operator": "greater_than", "value": 100}
            ]
        }))
        .unwrap();

        assert!(rule.enabled);
        assert_eq!(rule.schedule, Schedule::Immediate);
        assert_eq!(rule.conditions.len(), 1);
        assert!(rule.action_params.is_empty());
    }

    #[test]
    fn test_with_action_params() {
        let rule = Rule::new("r1", "n", "t", "a").with_action_params(json!({"to": "ops@example.com"}));
        assert_eq!(rule.action_params["to"], "ops@example.com");
    }
}
