//! Three-valued evaluation of override condition trees.
//!
//! Every node evaluates to one of three outcomes rather than a boolean:
//! a condition over an absent context property is neither satisfied nor
//! violated, and an override whose conditions cannot be fully decided is
//! skipped instead of applied.

use crate::hash::fnv1a_unit;
use crate::model::{Condition, Context, Override};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Matched,
    NotMatched,
    /// The condition could not be decided against this context.
    Unknown,
}

/// Select the effective value for a config: the value of the first override
/// whose conditions all evaluate `Matched`, or `base` when none does.
pub fn evaluate<'a>(base: &'a Value, overrides: &'a [Override], context: &Context) -> &'a Value {
    for entry in overrides {
        if all(&entry.conditions, context) == Outcome::Matched {
            tracing::trace!(name = %entry.name, "override matched");
            return &entry.value;
        }
    }
    base
}

/// Evaluate a single condition node against a context.
pub fn condition(node: &Condition, context: &Context) -> Outcome {
    match node {
        Condition::And { conditions } => all(conditions, context),
        Condition::Or { conditions } => any(conditions, context),
        Condition::Not { condition: inner } => match condition(inner, context) {
            Outcome::Matched => Outcome::NotMatched,
            Outcome::NotMatched => Outcome::Matched,
            Outcome::Unknown => Outcome::Unknown,
        },
        Condition::Equals { property, value } => equals(context, property, value),
        Condition::In { property, value } => membership(context, property, value, false),
        Condition::NotIn { property, value } => membership(context, property, value, true),
        Condition::LessThan { property, value } => {
            ordered(context, property, value, |ord| ord == Ordering::Less)
        }
        Condition::LessThanOrEqual { property, value } => {
            ordered(context, property, value, |ord| ord != Ordering::Greater)
        }
        Condition::GreaterThan { property, value } => {
            ordered(context, property, value, |ord| ord == Ordering::Greater)
        }
        Condition::GreaterThanOrEqual { property, value } => {
            ordered(context, property, value, |ord| ord != Ordering::Less)
        }
        Condition::Segmentation {
            property,
            from_percentage,
            to_percentage,
            seed,
        } => segmentation(context, property, *from_percentage, *to_percentage, seed),
    }
}

// Conjunction: a single NotMatched child decides the outcome even when
// siblings are Unknown.
fn all(conditions: &[Condition], context: &Context) -> Outcome {
    let mut outcome = Outcome::Matched;
    for node in conditions {
        match condition(node, context) {
            Outcome::NotMatched => return Outcome::NotMatched,
            Outcome::Unknown => outcome = Outcome::Unknown,
            Outcome::Matched => {}
        }
    }
    outcome
}

fn any(conditions: &[Condition], context: &Context) -> Outcome {
    let mut outcome = Outcome::NotMatched;
    for node in conditions {
        match condition(node, context) {
            Outcome::Matched => return Outcome::Matched,
            Outcome::Unknown => outcome = Outcome::Unknown,
            Outcome::NotMatched => {}
        }
    }
    outcome
}

fn equals(context: &Context, property: &str, expected: &Value) -> Outcome {
    let Some(actual) = context.get(property) else {
        return Outcome::Unknown;
    };
    if values_equal(&coerce(expected, actual), actual) {
        Outcome::Matched
    } else {
        Outcome::NotMatched
    }
}

fn membership(context: &Context, property: &str, expected: &Value, negate: bool) -> Outcome {
    let Some(actual) = context.get(property) else {
        return Outcome::Unknown;
    };
    let Value::Array(entries) = expected else {
        return Outcome::Unknown;
    };
    let contained = entries
        .iter()
        .any(|entry| values_equal(&coerce(entry, actual), actual));
    if contained != negate {
        Outcome::Matched
    } else {
        Outcome::NotMatched
    }
}

fn ordered(
    context: &Context,
    property: &str,
    expected: &Value,
    accept: fn(Ordering) -> bool,
) -> Outcome {
    let Some(actual) = context.get(property) else {
        return Outcome::Unknown;
    };
    let ord = match (actual, &coerce(expected, actual)) {
        (Value::Number(actual), Value::Number(expected)) => {
            let actual = actual.as_f64().unwrap_or(f64::NAN);
            let expected = expected.as_f64().unwrap_or(f64::NAN);
            actual.partial_cmp(&expected)
        }
        (Value::String(actual), Value::String(expected)) => {
            Some(actual.as_str().cmp(expected.as_str()))
        }
        _ => None,
    };
    match ord {
        Some(ord) if accept(ord) => Outcome::Matched,
        _ => Outcome::NotMatched,
    }
}

fn segmentation(context: &Context, property: &str, from: f64, to: f64, seed: &str) -> Outcome {
    let actual = match context.get(property) {
        None | Some(Value::Null) => return Outcome::Unknown,
        Some(actual) => actual,
    };
    let key = match actual {
        // Strings bucket on their verbatim contents, not their JSON form.
        Value::String(text) => format!("{text}{seed}"),
        other => format!("{other}{seed}"),
    };
    let bucket = fnv1a_unit(&key);
    if bucket >= from / 100.0 && bucket < to / 100.0 {
        Outcome::Matched
    } else {
        Outcome::NotMatched
    }
}

// Equality with numeric semantics: integer and float encodings of the same
// number are the same value.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => left.as_f64() == right.as_f64(),
        _ => left == right,
    }
}

/// Normalize an expected value toward the runtime type of the context value
/// before comparison. Loosely-typed server data ("5", 0/1 booleans) is
/// accepted; anything that does not coerce is returned unchanged and the
/// comparison decides.
fn coerce(expected: &Value, actual: &Value) -> Value {
    match (actual, expected) {
        (Value::Number(_), Value::String(text)) => match text.parse::<f64>() {
            Ok(parsed) => serde_json::Number::from_f64(parsed)
                .map(Value::Number)
                .unwrap_or_else(|| expected.clone()),
            Err(_) => expected.clone(),
        },
        (Value::Bool(_), Value::String(text)) if text == "true" => Value::Bool(true),
        (Value::Bool(_), Value::String(text)) if text == "false" => Value::Bool(false),
        (Value::Bool(_), Value::Number(number)) => Value::Bool(number.as_f64() != Some(0.0)),
        (Value::String(_), Value::Number(number)) => Value::String(number.to_string()),
        (Value::String(_), Value::Bool(flag)) => Value::String(flag.to_string()),
        _ => expected.clone(),
    }
}
