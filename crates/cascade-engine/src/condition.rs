//! Condition expressions — a tagged tree evaluated by a pure interpreter.
//!
//! User-authored boolean logic is data, never executable code. Evaluation
//! has no side effects and no external calls, so a failed evaluation is a
//! classifiable error (the rule is skipped and logged `failed`), never a
//! silent match.

use cascade_core::{CascadeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator for [`Condition::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// String or array containment.
    Contains,
}

/// Boolean expression tree over an event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Conjunction; true when empty.
    All { conditions: Vec<Condition> },
    /// Disjunction; false when empty.
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    /// Compare a dotted payload path against a literal.
    Compare {
        field: String,
        cmp: Comparator,
        value: Value,
    },
    /// True when the dotted path resolves to a non-null value.
    Exists { field: String },
}

impl Condition {
    /// Evaluate against an event payload.
    ///
    /// Errors (missing field in a comparison, type mismatch) propagate up
    /// so the caller can log the rule as `failed` rather than firing it.
    pub fn evaluate(&self, payload: &Value) -> Result<bool> {
        match self {
            Condition::All { conditions } => {
                for c in conditions {
                    if !c.evaluate(payload)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any { conditions } => {
                for c in conditions {
                    if c.evaluate(payload)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => Ok(!condition.evaluate(payload)?),
            Condition::Compare { field, cmp, value } => {
                let actual = lookup(payload, field).ok_or_else(|| {
                    CascadeError::Condition(format!("field '{field}' not found in payload"))
                })?;
                compare(actual, *cmp, value, field)
            }
            Condition::Exists { field } => {
                Ok(matches!(lookup(payload, field), Some(v) if !v.is_null()))
            }
        }
    }

    /// Convenience constructor for a single comparison.
    pub fn compare(field: &str, cmp: Comparator, value: Value) -> Self {
        Condition::Compare {
            field: field.to_string(),
            cmp,
            value,
        }
    }
}

/// Resolve a dotted path (`client.balance.amount`) into a payload.
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn compare(actual: &Value, cmp: Comparator, expected: &Value, field: &str) -> Result<bool> {
    match cmp {
        Comparator::Eq => Ok(actual == expected),
        Comparator::Ne => Ok(actual != expected),
        Comparator::Gt | Comparator::Gte | Comparator::Lt | Comparator::Lte => {
            let (a, b) = match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    // Lexicographic ordering for string pairs (ISO dates etc.)
                    if let (Some(a), Some(b)) = (actual.as_str(), expected.as_str()) {
                        return Ok(match cmp {
                            Comparator::Gt => a > b,
                            Comparator::Gte => a >= b,
                            Comparator::Lt => a < b,
                            Comparator::Lte => a <= b,
                            _ => unreachable!(),
                        });
                    }
                    return Err(CascadeError::Condition(format!(
                        "field '{field}': cannot order {actual} against {expected}"
                    )));
                }
            };
            Ok(match cmp {
                Comparator::Gt => a > b,
                Comparator::Gte => a >= b,
                Comparator::Lt => a < b,
                Comparator::Lte => a <= b,
                _ => unreachable!(),
            })
        }
        Comparator::Contains => match actual {
            Value::String(s) => {
                let needle = expected.as_str().ok_or_else(|| {
                    CascadeError::Condition(format!(
                        "field '{field}': contains on a string needs a string operand"
                    ))
                })?;
                Ok(s.contains(needle))
            }
            Value::Array(items) => Ok(items.contains(expected)),
            other => Err(CascadeError::Condition(format!(
                "field '{field}': contains not supported on {other}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_comparison() {
        let payload = json!({"days_overdue": 35});
        let cond = Condition::compare("days_overdue", Comparator::Gt, json!(30));
        assert!(cond.evaluate(&payload).unwrap());

        let payload = json!({"days_overdue": 10});
        assert!(!cond.evaluate(&payload).unwrap());
    }

    #[test]
    fn test_dotted_path() {
        let payload = json!({"client": {"tier": "gold", "balance": {"amount": 1200.5}}});
        let cond = Condition::compare("client.balance.amount", Comparator::Gte, json!(1000));
        assert!(cond.evaluate(&payload).unwrap());
        let cond = Condition::compare("client.tier", Comparator::Eq, json!("gold"));
        assert!(cond.evaluate(&payload).unwrap());
    }

    #[test]
    fn test_missing_field_is_error_not_false() {
        let cond = Condition::compare("nope", Comparator::Eq, json!(1));
        let err = cond.evaluate(&json!({})).unwrap_err();
        assert!(matches!(err, CascadeError::Condition(_)));
    }

    #[test]
    fn test_type_mismatch_is_error() {
        let cond = Condition::compare("x", Comparator::Gt, json!(5));
        let err = cond.evaluate(&json!({"x": {"nested": true}})).unwrap_err();
        assert!(matches!(err, CascadeError::Condition(_)));
    }

    #[test]
    fn test_exists_never_errors() {
        let cond = Condition::Exists { field: "a.b".into() };
        assert!(cond.evaluate(&json!({"a": {"b": 1}})).unwrap());
        assert!(!cond.evaluate(&json!({"a": {}})).unwrap());
        assert!(!cond.evaluate(&json!({"a": {"b": null}})).unwrap());
    }

    #[test]
    fn test_nested_boolean_logic() {
        let cond = Condition::All {
            conditions: vec![
                Condition::compare("status", Comparator::Eq, json!("overdue")),
                Condition::Any {
                    conditions: vec![
                        Condition::compare("amount", Comparator::Gt, json!(500)),
                        Condition::compare("tier", Comparator::Eq, json!("vip")),
                    ],
                },
                Condition::Not {
                    condition: Box::new(Condition::Exists {
                        field: "dispute_id".into(),
                    }),
                },
            ],
        };
        let payload = json!({"status": "overdue", "amount": 200, "tier": "vip"});
        assert!(cond.evaluate(&payload).unwrap());

        let disputed = json!({"status": "overdue", "amount": 900, "dispute_id": "d-1"});
        assert!(!cond.evaluate(&disputed).unwrap());
    }

    #[test]
    fn test_contains() {
        let payload = json!({"tags": ["billing", "vip"], "note": "final notice"});
        assert!(Condition::compare("tags", Comparator::Contains, json!("vip"))
            .evaluate(&payload)
            .unwrap());
        assert!(Condition::compare("note", Comparator::Contains, json!("final"))
            .evaluate(&payload)
            .unwrap());
    }

    #[test]
    fn test_serde_shape() {
        // Condition trees are stored as JSON on the rule row; the wire
        // shape is part of the rule-management contract.
        let cond: Condition = serde_json::from_value(json!({
            "op": "all",
            "conditions": [
                {"op": "compare", "field": "days_overdue", "cmp": "gt", "value": 30},
                {"op": "exists", "field": "invoice_id"}
            ]
        }))
        .unwrap();
        assert!(cond
            .evaluate(&json!({"days_overdue": 31, "invoice_id": "i-9"}))
            .unwrap());
    }
}
