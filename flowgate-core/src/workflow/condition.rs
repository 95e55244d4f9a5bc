//! Choice condition evaluation

use crate::models::definition::{ChoiceRule, Comparison, Condition};
use crate::workflow::error::WorkflowError;
use crate::workflow::path;
use serde_json::Value;

/// Evaluate a condition against working data.
///
/// Missing fields, invalid paths and type mismatches make a comparison false.
pub fn evaluate(condition: &Condition, data: &Value) -> bool {
    match condition {
        Condition::Compare {
            variable,
            comparison,
        } => {
            let value = path::select(data, variable).ok().flatten();
            compare(comparison, value)
        }
        Condition::And(conditions) => conditions.iter().all(|c| evaluate(c, data)),
        Condition::Or(conditions) => conditions.iter().any(|c| evaluate(c, data)),
        Condition::Not(inner) => !evaluate(inner, data),
    }
}

fn compare(comparison: &Comparison, value: Option<&Value>) -> bool {
    match (comparison, value) {
        (Comparison::IsPresent(expected), value) => value.is_some() == *expected,
        (_, None) => false,
        (Comparison::NumericEquals(n), Some(v)) => v.as_f64().is_some_and(|v| v == *n),
        (Comparison::NumericGreaterThan(n), Some(v)) => v.as_f64().is_some_and(|v| v > *n),
        (Comparison::NumericLessThan(n), Some(v)) => v.as_f64().is_some_and(|v| v < *n),
        (Comparison::NumericGreaterThanEquals(n), Some(v)) => v.as_f64().is_some_and(|v| v >= *n),
        (Comparison::NumericLessThanEquals(n), Some(v)) => v.as_f64().is_some_and(|v| v <= *n),
        (Comparison::StringEquals(s), Some(v)) => v.as_str() == Some(s.as_str()),
        (Comparison::BooleanEquals(b), Some(v)) => v.as_bool() == Some(*b),
    }
}

/// Pick the target of the first rule that holds, falling back to `default`
pub fn choose_next<'a>(
    state: &str,
    rules: &'a [ChoiceRule],
    default: Option<&'a str>,
    data: &Value,
) -> Result<&'a str, WorkflowError> {
    rules
        .iter()
        .find(|rule| evaluate(&rule.condition, data))
        .map(|rule| rule.next.as_str())
        .or(default)
        .ok_or_else(|| WorkflowError::Transition {
            state: state.to_string(),
            message: "no choice rule matched and no Default is declared".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmp(variable: &str, comparison: Comparison) -> Condition {
        Condition::Compare {
            variable: variable.to_string(),
            comparison,
        }
    }

    #[test]
    fn test_numeric_comparisons() {
        let data = json!({"amount": 250, "ratio": 0.5});
        assert!(evaluate(&cmp("$.amount", Comparison::NumericEquals(250.0)), &data));
        assert!(evaluate(&cmp("$.amount", Comparison::NumericGreaterThan(100.0)), &data));
        assert!(!evaluate(&cmp("$.amount", Comparison::NumericLessThan(100.0)), &data));
        assert!(evaluate(&cmp("$.amount", Comparison::NumericGreaterThanEquals(250.0)), &data));
        assert!(evaluate(&cmp("$.ratio", Comparison::NumericLessThanEquals(0.5)), &data));
    }

    #[test]
    fn test_missing_or_mistyped_field_is_false() {
        let data = json!({"amount": "250", "flag": true});
        assert!(!evaluate(&cmp("$.missing", Comparison::NumericEquals(1.0)), &data));
        assert!(!evaluate(&cmp("$.amount", Comparison::NumericEquals(250.0)), &data));
        assert!(!evaluate(&cmp("$.flag", Comparison::StringEquals("true".into())), &data));
        assert!(!evaluate(&cmp("not-a-path", Comparison::BooleanEquals(true)), &data));
        // Negating a missing comparison is true
        assert!(evaluate(
            &Condition::Not(Box::new(cmp("$.missing", Comparison::NumericEquals(1.0)))),
            &data
        ));
    }

    #[test]
    fn test_string_boolean_and_presence() {
        let data = json!({"region": "eu", "vip": false});
        assert!(evaluate(&cmp("$.region", Comparison::StringEquals("eu".into())), &data));
        assert!(evaluate(&cmp("$.vip", Comparison::BooleanEquals(false)), &data));
        assert!(evaluate(&cmp("$.vip", Comparison::IsPresent(true)), &data));
        assert!(evaluate(&cmp("$.other", Comparison::IsPresent(false)), &data));
    }

    #[test]
    fn test_combinators() {
        let data = json!({"a": 1, "b": 2});
        let both = Condition::And(vec![
            cmp("$.a", Comparison::NumericEquals(1.0)),
            cmp("$.b", Comparison::NumericEquals(2.0)),
        ]);
        let either = Condition::Or(vec![
            cmp("$.a", Comparison::NumericEquals(5.0)),
            cmp("$.b", Comparison::NumericEquals(2.0)),
        ]);
        assert!(evaluate(&both, &data));
        assert!(evaluate(&either, &data));
    }

    #[test]
    fn test_choose_next_falls_back_to_default() {
        let rules = vec![ChoiceRule {
            condition: cmp("$.amount", Comparison::NumericGreaterThan(1000.0)),
            next: "Large".to_string(),
        }];
        let data = json!({"amount": 5});
        assert_eq!(choose_next("Route", &rules, Some("Small"), &data).unwrap(), "Small");

        let error = choose_next("Route", &rules, None, &data).unwrap_err();
        assert!(matches!(error, WorkflowError::Transition { ref state, .. } if state == "Route"));
    }
}
