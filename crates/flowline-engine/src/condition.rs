//! Router branch conditions.
//!
//! A branch holds OR-of-AND groups of [`BranchCondition`]s. Operands are
//! template expressions resolved against the run state before comparison.
//! Evaluation never fails: operands that do not resolve compare as `null`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{Ancestor, ExecutionState};

/// Comparison performed by a [`BranchCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    TextContains,
    TextDoesNotContain,
    TextExactlyMatches,
    TextDoesNotExactlyMatch,
    TextStartsWith,
    TextEndsWith,
    NumberIsGreaterThan,
    NumberIsLessThan,
    NumberIsEqualTo,
    BooleanIsTrue,
    BooleanIsFalse,
    Exists,
    DoesNotExist,
    ListIsEmpty,
    ListIsNotEmpty,
}

impl ConditionOperator {
    /// Whether the operator compares against a second operand.
    pub fn is_binary(self) -> bool {
        !matches!(
            self,
            ConditionOperator::BooleanIsTrue
                | ConditionOperator::BooleanIsFalse
                | ConditionOperator::Exists
                | ConditionOperator::DoesNotExist
                | ConditionOperator::ListIsEmpty
                | ConditionOperator::ListIsNotEmpty
        )
    }
}

/// One comparison inside a router branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCondition {
    pub first_value: Value,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub second_value: Value,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_case_sensitive() -> bool {
    true
}

impl BranchCondition {
    pub fn new(first_value: Value, operator: ConditionOperator, second_value: Value) -> Self {
        Self {
            first_value,
            operator,
            second_value,
            case_sensitive: true,
        }
    }

    /// Resolve both operands and apply the operator.
    pub fn evaluate(&self, state: &ExecutionState, ancestors: &[Ancestor]) -> bool {
        let first = state.resolve(&self.first_value, ancestors);
        let second = if self.operator.is_binary() {
            state.resolve(&self.second_value, ancestors)
        } else {
            Value::Null
        };
        compare(self.operator, &first, &second, self.case_sensitive)
    }
}

/// Evaluate OR-of-AND condition groups. No groups means the branch always matches.
pub fn branch_matches(
    groups: &[Vec<BranchCondition>],
    state: &ExecutionState,
    ancestors: &[Ancestor],
) -> bool {
    if groups.is_empty() {
        return true;
    }
    groups
        .iter()
        .any(|group| group.iter().all(|cond| cond.evaluate(state, ancestors)))
}

fn compare(op: ConditionOperator, first: &Value, second: &Value, case_sensitive: bool) -> bool {
    let text = |v: &Value| {
        let s = value_to_text(v);
        if case_sensitive { s } else { s.to_lowercase() }
    };

    match op {
        ConditionOperator::TextContains => text_contains(first, &text(second), &text),
        ConditionOperator::TextDoesNotContain => !text_contains(first, &text(second), &text),
        ConditionOperator::TextExactlyMatches => text(first) == text(second),
        ConditionOperator::TextDoesNotExactlyMatch => text(first) != text(second),
        ConditionOperator::TextStartsWith => text(first).starts_with(&text(second)),
        ConditionOperator::TextEndsWith => text(first).ends_with(&text(second)),

        ConditionOperator::NumberIsGreaterThan => {
            matches!((value_to_f64(first), value_to_f64(second)), (Some(a), Some(b)) if a > b)
        }
        ConditionOperator::NumberIsLessThan => {
            matches!((value_to_f64(first), value_to_f64(second)), (Some(a), Some(b)) if a < b)
        }
        ConditionOperator::NumberIsEqualTo => matches!(
            (value_to_f64(first), value_to_f64(second)),
            (Some(a), Some(b)) if a == b
        ),

        ConditionOperator::BooleanIsTrue => value_to_bool(first) == Some(true),
        ConditionOperator::BooleanIsFalse => value_to_bool(first) == Some(false),

        ConditionOperator::Exists => !is_absent(first),
        ConditionOperator::DoesNotExist => is_absent(first),

        ConditionOperator::ListIsEmpty => matches!(first, Value::Array(a) if a.is_empty()),
        ConditionOperator::ListIsNotEmpty => matches!(first, Value::Array(a) if !a.is_empty()),
    }
}

fn text_contains(haystack: &Value, needle: &str, text: &dyn Fn(&Value) -> String) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| text(item) == needle),
        other => text(other).contains(needle),
    }
}

fn is_absent(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
