//! Definition parsing and serialization
//!
//! Documents are accepted as JSON or YAML. Parsing converts the wire document
//! into the [`Definition`] model, collecting every problem it finds, then runs
//! the validator so a rejected document reports all of its issues at once.

use crate::models::definition::{
    ApprovalConfig, CatchRule, ChoiceRule, ChoiceSpec, Comparison, Condition, Definition,
    FailSpec, MapSpec, ParallelSpec, PassSpec, RejectionPolicy, RetryRule, State, StateGraph,
    StateKind, StateType, TaskSpec, Transition, WaitSpec, COMPARATORS,
};
use crate::workflow::document::{
    ApprovalDocument, CatchDocument, DefinitionDocument, RetryDocument, StateDocument,
};
use crate::workflow::error::{ValidationError, ValidationIssue};
use crate::workflow::validator::WorkflowValidator;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Decode a JSON or YAML document into its wire form
pub fn parse_document(text: &str) -> Result<DefinitionDocument, ValidationError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed)
            .map_err(|e| ValidationError::single("document", format!("invalid JSON: {}", e)))
    } else {
        serde_yaml::from_str(text)
            .map_err(|e| ValidationError::single("document", format!("invalid YAML: {}", e)))
    }
}

/// Parse and validate a definition document
pub fn parse_definition(name: &str, text: &str) -> Result<Definition, ValidationError> {
    let document = parse_document(text)?;
    from_document(name, &document)
}

/// Convert a wire document into a validated definition
pub fn from_document(name: &str, document: &DefinitionDocument) -> Result<Definition, ValidationError> {
    let mut issues = Vec::new();
    let graph = build_graph("", document, &mut issues);

    if let Some(timeout) = document.timeout_seconds {
        if timeout == 0 {
            issues.push(issue("TimeoutSeconds", "TimeoutSeconds must be greater than 0"));
        }
    }

    let definition = Definition {
        name: name.to_string(),
        comment: document.comment.clone(),
        version: 0,
        timeout_seconds: document.timeout_seconds.filter(|t| *t > 0),
        graph,
    };

    let validation = WorkflowValidator::validate_definition(&definition);
    for warning in &validation.warnings {
        tracing::warn!(definition = %name, "{}", warning);
    }
    issues.extend(validation.errors);

    if issues.is_empty() {
        Ok(definition)
    } else {
        Err(ValidationError { issues })
    }
}

fn issue(location: impl Into<String>, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        location: location.into(),
        message: message.into(),
    }
}

fn warn_unknown(location: &str, unknown: &BTreeMap<String, Value>) {
    for field in unknown.keys() {
        tracing::warn!(location = %location, field = %field, "ignoring unknown field");
    }
}

fn build_graph(prefix: &str, document: &DefinitionDocument, issues: &mut Vec<ValidationIssue>) -> StateGraph {
    warn_unknown(if prefix.is_empty() { "$" } else { prefix }, &document.unknown);

    let states = document
        .states
        .iter()
        .map(|(name, state)| {
            let location = format!("{}States.{}", prefix, name);
            (name.clone(), build_state(&location, name, state, issues))
        })
        .collect();

    StateGraph {
        start_at: document.start_at.clone().unwrap_or_default(),
        states,
    }
}

/// A state that could not be built is replaced by a terminal Pass so later
/// checks don't cascade from the same root cause.
fn placeholder(name: &str) -> State {
    State {
        name: name.to_string(),
        comment: None,
        kind: StateKind::Pass(PassSpec {
            result: None,
            parameters: None,
            result_path: None,
        }),
        transition: Some(Transition::End),
        input_path: None,
        output_path: None,
        retry: Vec::new(),
        catch: Vec::new(),
        approval: None,
    }
}

fn build_state(
    location: &str,
    name: &str,
    document: &StateDocument,
    issues: &mut Vec<ValidationIssue>,
) -> State {
    warn_unknown(location, &document.unknown);

    let state_type = match document.state_type.as_deref() {
        None => {
            issues.push(issue(format!("{}.Type", location), "Type is required"));
            return placeholder(name);
        }
        Some(value) => match StateType::parse(value) {
            Some(state_type) => state_type,
            None => {
                issues.push(issue(
                    format!("{}.Type", location),
                    format!("unknown state type '{}'", value),
                ));
                return placeholder(name);
            }
        },
    };

    let transition = match (&document.next, document.end) {
        (Some(next), Some(true)) => {
            issues.push(issue(
                format!("{}.End", location),
                "a state cannot declare both Next and End",
            ));
            Some(Transition::Next(next.clone()))
        }
        (Some(next), _) => Some(Transition::Next(next.clone())),
        (None, Some(true)) => Some(Transition::End),
        (None, _) => None,
    };

    let kind = match state_type {
        StateType::Task => StateKind::Task(TaskSpec {
            resource: document.resource.clone().unwrap_or_default(),
            parameters: document.parameters.clone(),
            result_path: document.result_path.clone(),
            timeout_seconds: document.timeout_seconds,
        }),
        StateType::Choice => StateKind::Choice(ChoiceSpec {
            rules: build_choice_rules(location, document.choices.as_deref().unwrap_or(&[]), issues),
            default: document.default.clone(),
        }),
        StateType::Parallel => StateKind::Parallel(ParallelSpec {
            branches: document
                .branches
                .iter()
                .flatten()
                .enumerate()
                .map(|(index, branch)| {
                    build_graph(&format!("{}.Branches[{}].", location, index), branch, issues)
                })
                .collect(),
            result_path: document.result_path.clone(),
        }),
        StateType::Wait => StateKind::Wait(build_wait(location, document, issues)),
        StateType::Map => {
            let iterator = match &document.iterator {
                Some(iterator) => build_graph(&format!("{}.Iterator.", location), iterator, issues),
                None => {
                    issues.push(issue(
                        format!("{}.Iterator", location),
                        "Map states require an Iterator",
                    ));
                    return placeholder(name);
                }
            };
            StateKind::Map(MapSpec {
                iterator: Box::new(iterator),
                items_path: document.items_path.clone().unwrap_or_else(|| "$".to_string()),
                max_concurrency: document.max_concurrency.unwrap_or(0),
                result_path: document.result_path.clone(),
            })
        }
        StateType::Pass => StateKind::Pass(PassSpec {
            result: document.result.clone(),
            parameters: document.parameters.clone(),
            result_path: document.result_path.clone(),
        }),
        StateType::Succeed => StateKind::Succeed,
        StateType::Fail => StateKind::Fail(FailSpec {
            error: document.error.clone(),
            cause: document.cause.clone(),
        }),
    };

    let approval = document
        .approval
        .as_ref()
        .map(|approval| build_approval(location, approval, issues));

    State {
        name: name.to_string(),
        comment: document.comment.clone(),
        kind,
        transition,
        input_path: document.input_path.clone(),
        output_path: document.output_path.clone(),
        retry: document.retry.iter().map(build_retry).collect(),
        catch: document.catch.iter().enumerate().map(|(index, catcher)| {
            build_catch(&format!("{}.Catch[{}]", location, index), catcher, issues)
        }).collect(),
        approval,
    }
}

fn build_wait(location: &str, document: &StateDocument, issues: &mut Vec<ValidationIssue>) -> WaitSpec {
    let declared = [
        document.seconds.is_some(),
        document.timestamp.is_some(),
        document.seconds_path.is_some(),
        document.timestamp_path.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();

    if declared != 1 {
        issues.push(issue(
            location,
            "Wait states require exactly one of Seconds, Timestamp, SecondsPath or TimestampPath",
        ));
    }

    if let Some(seconds) = document.seconds {
        WaitSpec::Seconds(seconds)
    } else if let Some(timestamp) = &document.timestamp {
        match DateTime::parse_from_rfc3339(timestamp) {
            Ok(at) => WaitSpec::Timestamp(at.with_timezone(&Utc)),
            Err(e) => {
                issues.push(issue(
                    format!("{}.Timestamp", location),
                    format!("invalid RFC 3339 timestamp '{}': {}", timestamp, e),
                ));
                WaitSpec::Seconds(0)
            }
        }
    } else if let Some(path) = &document.seconds_path {
        WaitSpec::SecondsPath(path.clone())
    } else if let Some(path) = &document.timestamp_path {
        WaitSpec::TimestampPath(path.clone())
    } else {
        WaitSpec::Seconds(0)
    }
}

fn build_choice_rules(
    location: &str,
    choices: &[Value],
    issues: &mut Vec<ValidationIssue>,
) -> Vec<ChoiceRule> {
    let mut rules = Vec::new();
    for (index, choice) in choices.iter().enumerate() {
        let rule_location = format!("{}.Choices[{}]", location, index);
        let Some(map) = choice.as_object() else {
            issues.push(issue(rule_location, "choice rule must be an object"));
            continue;
        };
        let Some(next) = map.get("Next").and_then(Value::as_str) else {
            issues.push(issue(format!("{}.Next", rule_location), "choice rule requires Next"));
            continue;
        };
        match parse_condition(map) {
            Ok(condition) => rules.push(ChoiceRule {
                condition,
                next: next.to_string(),
            }),
            Err(message) => issues.push(issue(rule_location, message)),
        }
    }
    rules
}

fn parse_condition(map: &Map<String, Value>) -> Result<Condition, String> {
    for combinator in ["And", "Or"] {
        if let Some(value) = map.get(combinator) {
            let items = value
                .as_array()
                .ok_or_else(|| format!("{} must be an array of conditions", combinator))?;
            let nested = items
                .iter()
                .map(nested_condition)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(if combinator == "And" {
                Condition::And(nested)
            } else {
                Condition::Or(nested)
            });
        }
    }
    if let Some(value) = map.get("Not") {
        return Ok(Condition::Not(Box::new(nested_condition(value)?)));
    }

    let variable = map
        .get("Variable")
        .and_then(Value::as_str)
        .ok_or("condition requires a Variable string")?;
    let mut comparisons = map
        .iter()
        .filter_map(|(key, operand)| Comparison::from_operator(key, operand));
    let comparison = match (comparisons.next(), comparisons.next()) {
        (Some(comparison), None) => comparison?,
        (None, _) => {
            return Err(format!(
                "condition requires one comparator ({})",
                COMPARATORS.join(", ")
            ))
        }
        (Some(_), Some(_)) => return Err("condition declares more than one comparator".to_string()),
    };

    Ok(Condition::Compare {
        variable: variable.to_string(),
        comparison,
    })
}

fn nested_condition(value: &Value) -> Result<Condition, String> {
    let map = value
        .as_object()
        .ok_or("nested condition must be an object")?;
    if map.contains_key("Next") {
        return Err("nested conditions cannot declare Next".to_string());
    }
    parse_condition(map)
}

fn build_retry(document: &RetryDocument) -> RetryRule {
    RetryRule {
        error_equals: document.error_equals.clone(),
        interval_seconds: document
            .interval_seconds
            .unwrap_or(RetryRule::DEFAULT_INTERVAL_SECONDS),
        max_attempts: document.max_attempts.unwrap_or(RetryRule::DEFAULT_MAX_ATTEMPTS),
        backoff_rate: document.backoff_rate.unwrap_or(RetryRule::DEFAULT_BACKOFF_RATE),
    }
}

fn build_catch(location: &str, document: &CatchDocument, issues: &mut Vec<ValidationIssue>) -> CatchRule {
    if document.next.is_none() {
        issues.push(issue(format!("{}.Next", location), "catcher requires Next"));
    }
    CatchRule {
        error_equals: document.error_equals.clone(),
        next: document.next.clone().unwrap_or_default(),
        result_path: document.result_path.clone(),
    }
}

fn build_approval(
    location: &str,
    document: &ApprovalDocument,
    issues: &mut Vec<ValidationIssue>,
) -> ApprovalConfig {
    let on_rejection = match document.on_rejection.as_deref() {
        None => RejectionPolicy::default(),
        Some(value) => RejectionPolicy::parse(value).unwrap_or_else(|| {
            issues.push(issue(
                format!("{}.Approval.OnRejection", location),
                format!(
                    "unknown rejection policy '{}' (expected terminate, continue, escalate or alternate_path)",
                    value
                ),
            ));
            RejectionPolicy::default()
        }),
    };

    ApprovalConfig {
        role: document.role.clone().unwrap_or_default(),
        description: document.description.clone(),
        on_rejection,
        escalation_role: document.escalation_role.clone(),
        alternate_state: document.alternate_state.clone(),
    }
}

/// Convert a definition back into its wire document
pub fn to_document(definition: &Definition) -> DefinitionDocument {
    let mut document = graph_document(&definition.graph);
    document.comment = definition.comment.clone();
    document.timeout_seconds = definition.timeout_seconds;
    document
}

/// Serialize a definition as pretty-printed JSON
pub fn serialize_definition(definition: &Definition) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&to_document(definition))
}

fn graph_document(graph: &StateGraph) -> DefinitionDocument {
    DefinitionDocument {
        start_at: Some(graph.start_at.clone()),
        states: graph
            .states
            .iter()
            .map(|(name, state)| (name.clone(), state_document(state)))
            .collect(),
        ..Default::default()
    }
}

fn state_document(state: &State) -> StateDocument {
    let mut document = StateDocument {
        state_type: Some(state.state_type().to_string()),
        comment: state.comment.clone(),
        input_path: state.input_path.clone(),
        output_path: state.output_path.clone(),
        ..Default::default()
    };

    match &state.transition {
        Some(Transition::Next(next)) => document.next = Some(next.clone()),
        Some(Transition::End) => document.end = Some(true),
        None => {}
    }

    match &state.kind {
        StateKind::Task(task) => {
            document.resource = Some(task.resource.clone());
            document.parameters = task.parameters.clone();
            document.result_path = task.result_path.clone();
            document.timeout_seconds = task.timeout_seconds;
        }
        StateKind::Choice(choice) => {
            document.choices = Some(
                choice
                    .rules
                    .iter()
                    .map(|rule| {
                        let mut map = condition_map(&rule.condition);
                        map.insert("Next".to_string(), Value::String(rule.next.clone()));
                        Value::Object(map)
                    })
                    .collect(),
            );
            document.default = choice.default.clone();
        }
        StateKind::Parallel(parallel) => {
            document.branches = Some(parallel.branches.iter().map(graph_document).collect());
            document.result_path = parallel.result_path.clone();
        }
        StateKind::Wait(wait) => match wait {
            WaitSpec::Seconds(seconds) => document.seconds = Some(*seconds),
            WaitSpec::Timestamp(at) => document.timestamp = Some(at.to_rfc3339()),
            WaitSpec::SecondsPath(path) => document.seconds_path = Some(path.clone()),
            WaitSpec::TimestampPath(path) => document.timestamp_path = Some(path.clone()),
        },
        StateKind::Map(map) => {
            document.iterator = Some(Box::new(graph_document(&map.iterator)));
            document.items_path = Some(map.items_path.clone());
            document.max_concurrency = Some(map.max_concurrency);
            document.result_path = map.result_path.clone();
        }
        StateKind::Pass(pass) => {
            document.result = pass.result.clone();
            document.parameters = pass.parameters.clone();
            document.result_path = pass.result_path.clone();
        }
        StateKind::Succeed => {}
        StateKind::Fail(fail) => {
            document.error = fail.error.clone();
            document.cause = fail.cause.clone();
        }
    }

    document.retry = state
        .retry
        .iter()
        .map(|rule| RetryDocument {
            error_equals: rule.error_equals.clone(),
            interval_seconds: Some(rule.interval_seconds),
            max_attempts: Some(rule.max_attempts),
            backoff_rate: Some(rule.backoff_rate),
        })
        .collect();
    document.catch = state
        .catch
        .iter()
        .map(|catcher| CatchDocument {
            error_equals: catcher.error_equals.clone(),
            next: Some(catcher.next.clone()),
            result_path: catcher.result_path.clone(),
        })
        .collect();
    document.approval = state.approval.as_ref().map(|approval| ApprovalDocument {
        role: Some(approval.role.clone()),
        description: approval.description.clone(),
        on_rejection: Some(approval.on_rejection.as_str().to_string()),
        escalation_role: approval.escalation_role.clone(),
        alternate_state: approval.alternate_state.clone(),
    });

    document
}

fn condition_map(condition: &Condition) -> Map<String, Value> {
    let mut map = Map::new();
    match condition {
        Condition::Compare {
            variable,
            comparison,
        } => {
            map.insert("Variable".to_string(), Value::String(variable.clone()));
            map.insert(comparison.operator().to_string(), comparison.operand());
        }
        Condition::And(inner) => {
            map.insert("And".to_string(), condition_list(inner));
        }
        Condition::Or(inner) => {
            map.insert("Or".to_string(), condition_list(inner));
        }
        Condition::Not(inner) => {
            map.insert("Not".to_string(), Value::Object(condition_map(inner)));
        }
    }
    map
}

fn condition_list(conditions: &[Condition]) -> Value {
    Value::Array(
        conditions
            .iter()
            .map(|condition| Value::Object(condition_map(condition)))
            .collect(),
    )
}
