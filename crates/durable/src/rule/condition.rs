//! Rule conditions
//!
//! A condition compares one trigger parameter (looked up by exact key) with
//! a literal value. A rule's conditions are combined with logical AND.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Parameters;

/// Error raised when a condition cannot be evaluated
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    /// Numeric comparison on a value that is not a number
    #[error("field '{field}' is not numeric (got {actual}) for operator {operator}")]
    NotNumeric {
        field: String,
        operator: ConditionOperator,
        actual: Value,
    },

    /// Operator not applicable to the field's type
    #[error("operator {operator} cannot be applied to field '{field}' of value {actual}")]
    TypeMismatch {
        field: String,
        operator: ConditionOperator,
        actual: Value,
    },
}

/// Comparison operators for conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    /// Substring for strings, membership for arrays
    Contains,
    StartsWith,
    EndsWith,
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
        };
        f.write_str(name)
    }
}

/// Literal a condition compares against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl ConditionValue {
    fn as_text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
        }
    }

    /// Loose equality against a JSON parameter value
    ///
    /// Numbers compare numerically (numeric strings are parsed), booleans
    /// also accept "true"/"false" strings, strings compare against the
    /// textual form of scalars.
    fn loosely_equals(&self, actual: &Value) -> bool {
        match (self, actual) {
            (Self::Bool(expected), Value::Bool(b)) => expected == b,
            (Self::Bool(expected), Value::String(s)) => s.parse::<bool>().ok() == Some(*expected),
            (Self::Number(expected), other) => as_number(other) == Some(*expected),
            (Self::String(expected), Value::String(s)) => expected == s,
            (Self::String(expected), Value::Number(_) | Value::Bool(_)) => {
                scalar_text(actual).as_deref() == Some(expected.as_str())
            }
            _ => false,
        }
    }
}

impl From<bool> for ConditionValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for ConditionValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for ConditionValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for ConditionValue {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<&str> for ConditionValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ConditionValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A single `field <operator> value` check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<ConditionValue>) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<ConditionValue>) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, value)
    }

    pub fn less_than(field: impl Into<String>, value: impl Into<ConditionValue>) -> Self {
        Self::new(field, ConditionOperator::LessThan, value)
    }

    pub fn contains(field: impl Into<String>, value: impl Into<ConditionValue>) -> Self {
        Self::new(field, ConditionOperator::Contains, value)
    }

    /// Evaluate against trigger parameters
    ///
    /// A missing (or null) field satisfies only `NotEquals`.
    pub fn evaluate(&self, parameters: &Parameters) -> Result<bool, ConditionError> {
        let actual = match parameters.get(&self.field) {
            Some(Value::Null) | None => {
                return Ok(self.operator == ConditionOperator::NotEquals);
            }
            Some(value) => value,
        };

        match self.operator {
            ConditionOperator::Equals => Ok(self.value.loosely_equals(actual)),
            ConditionOperator::NotEquals => Ok(!self.value.loosely_equals(actual)),
            ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
                let (lhs, rhs) = self.numeric_operands(actual)?;
                Ok(if self.operator == ConditionOperator::GreaterThan {
                    lhs > rhs
                } else {
                    lhs < rhs
                })
            }
            ConditionOperator::Contains => match actual {
                Value::Array(items) => Ok(items.iter().any(|item| self.value.loosely_equals(item))),
                _ => {
                    let text = self.text_operand(actual)?;
                    Ok(text.contains(&self.value.as_text()))
                }
            },
            ConditionOperator::StartsWith => {
                Ok(self.text_operand(actual)?.starts_with(&self.value.as_text()))
            }
            ConditionOperator::EndsWith => {
                Ok(self.text_operand(actual)?.ends_with(&self.value.as_text()))
            }
        }
    }

    fn numeric_operands(&self, actual: &Value) -> Result<(f64, f64), ConditionError> {
        let not_numeric = || ConditionError::NotNumeric {
            field: self.field.clone(),
            operator: self.operator,
            actual: actual.clone(),
        };

        let lhs = as_number(actual).ok_or_else(not_numeric)?;
        let rhs = match &self.value {
            ConditionValue::Number(n) => *n,
            ConditionValue::String(s) => s.trim().parse::<f64>().map_err(|_| not_numeric())?,
            ConditionValue::Bool(_) => return Err(not_numeric()),
        };
        Ok((lhs, rhs))
    }

    fn text_operand(&self, actual: &Value) -> Result<String, ConditionError> {
        scalar_text(actual).ok_or_else(|| ConditionError::TypeMismatch {
            field: self.field.clone(),
            operator: self.operator,
            actual: actual.clone(),
        })
    }
}

/// AND of all conditions; an empty list always matches
pub fn evaluate_all(conditions: &[Condition], parameters: &Parameters) -> Result<bool, ConditionError> {
    for condition in conditions {
        if !condition.evaluate(parameters)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if n.is_f64() => format_number(f),
            _ => n.to_string(),
        }),
        _ => None,
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_and_semantics() {
        let conditions = vec![
            Condition::greater_than("amount", 100),
            Condition::equals("vip", true),
        ];

        assert!(evaluate_all(&conditions, &params(json!({"amount": 150, "vip": true}))).unwrap());
        assert!(!evaluate_all(&conditions, &params(json!({"amount": 150, "vip": false}))).unwrap());
        assert!(!evaluate_all(&conditions, &params(json!({"amount": 50, "vip": true}))).unwrap());
    }

    #[test]
    fn test_empty_conditions_always_match() {
        assert!(evaluate_all(&[], &Parameters::new()).unwrap());
    }

    #[test]
    fn test_equals_is_loose_on_numbers_and_bools() {
        let p = params(json!({"count": "3", "flag": "true", "code": 42}));

        assert!(Condition::equals("count", 3).evaluate(&p).unwrap());
        assert!(Condition::equals("flag", true).evaluate(&p).unwrap());
        assert!(Condition::equals("code", "42").evaluate(&p).unwrap());
        assert!(!Condition::equals("code", 43).evaluate(&p).unwrap());
    }

    #[test]
    fn test_missing_field() {
        let p = Parameters::new();
        assert!(!Condition::equals("status", "paid").evaluate(&p).unwrap());
        assert!(Condition::new("status", ConditionOperator::NotEquals, "paid")
            .evaluate(&p)
            .unwrap());
        assert!(!Condition::greater_than("amount", 1).evaluate(&p).unwrap());
    }

    #[test]
    fn test_string_operators() {
        let p = params(json!({"email": "ops@example.com"}));

        assert!(Condition::contains("email", "@example").evaluate(&p).unwrap());
        assert!(Condition::new("email", ConditionOperator::StartsWith, "ops")
            .evaluate(&p)
            .unwrap());
        assert!(Condition::new("email", ConditionOperator::EndsWith, ".com")
            .evaluate(&p)
            .unwrap());
        assert!(!Condition::new("email", ConditionOperator::EndsWith, ".org")
            .evaluate(&p)
            .unwrap());
    }

    #[test]
    fn test_contains_on_array() {
        let p = params(json!({"tags": ["urgent", "billing"]}));
        assert!(Condition::contains("tags", "billing").evaluate(&p).unwrap());
        assert!(!Condition::contains("tags", "sales").evaluate(&p).unwrap());
    }

    #[test]
    fn test_less_than() {
        let p = params(json!({"temperature": 18.5}));
        assert!(Condition::less_than("temperature", 20).evaluate(&p).unwrap());
        assert!(!Condition::less_than("temperature", 10).evaluate(&p).unwrap());
    }

    #[test]
    fn test_numeric_operator_on_text_is_an_error() {
        let p = params(json!({"amount": "lots"}));
        let err = Condition::greater_than("amount", 10).evaluate(&p).unwrap_err();
        assert!(matches!(err, ConditionError::NotNumeric { ref field, .. } if field == "amount"));
    }

    #[test]
    fn test_string_operator_on_object_is_an_error() {
        let p = params(json!({"meta": {"a": 1}}));
        let err = Condition::contains("meta", "a").evaluate(&p).unwrap_err();
        assert!(matches!(err, ConditionError::TypeMismatch { .. }));
    }

    #[test]
    fn test_deserialize_condition() {
        let condition: Condition = serde_json::from_value(json!({
            "field": "amount",
            "operator": "greater_than",
            "value": 100
        }))
        .unwrap();

        assert_eq!(condition, Condition::greater_than("amount", 100));
    }
}
