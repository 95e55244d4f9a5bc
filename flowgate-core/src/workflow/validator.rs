//! Definition validation logic

use crate::models::definition::{
    ApprovalConfig, Condition, Definition, RejectionPolicy, RetryRule, State, StateGraph,
    StateKind, Transition, WaitSpec, ERROR_ALL, MAX_DURATION_SECONDS,
};
use crate::workflow::error::{ValidationError, ValidationIssue};
use crate::workflow::path;
use std::collections::VecDeque;

/// Upper bound accepted for `MaxAttempts`
pub const MAX_RETRY_ATTEMPTS: u32 = 99;

/// Validation outcome: hard errors plus advisory warnings
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            location: location.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Fail closed: any error rejects the definition
    pub fn into_result(self) -> Result<Vec<String>, ValidationError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(ValidationError {
                issues: self.errors,
            })
        }
    }
}

/// Definition validator
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Validate a retrier
    /// - ErrorEquals non-empty
    /// - IntervalSeconds >= 1
    /// - MaxAttempts <= 99
    /// - BackoffRate >= 1.0
    pub fn validate_retry_rule(rule: &RetryRule, location: &str, max_backoff_seconds: f64) -> ValidationResult {
        let mut result = ValidationResult::new();

        if rule.error_equals.is_empty() {
            result.add_error(
                format!("{}.ErrorEquals", location),
                "ErrorEquals must list at least one error name",
            );
        }

        if rule.interval_seconds < 1 {
            result.add_error(
                format!("{}.IntervalSeconds", location),
                "IntervalSeconds must be at least 1",
            );
        }

        if rule.max_attempts > MAX_RETRY_ATTEMPTS {
            result.add_error(
                format!("{}.MaxAttempts", location),
                format!("MaxAttempts cannot exceed {}", MAX_RETRY_ATTEMPTS),
            );
        }

        if rule.backoff_rate < 1.0 {
            result.add_error(
                format!("{}.BackoffRate", location),
                "BackoffRate must be at least 1.0",
            );
        }

        // Warn when the backoff would be clamped by the engine cap
        if rule.max_attempts > 0 {
            let uncapped = rule.delay_seconds(rule.max_attempts, f64::INFINITY);
            if uncapped > max_backoff_seconds {
                result.add_warning(format!(
                    "{}: backoff reaches {:.0}s and will be capped at {:.0}s",
                    location, uncapped, max_backoff_seconds
                ));
            }
        }

        result
    }

    /// Validate a definition with the default backoff cap
    pub fn validate_definition(definition: &Definition) -> ValidationResult {
        Self::validate_definition_with_cap(definition, 600.0)
    }

    /// Validate every graph of a definition, collecting all issues.
    ///
    /// Nested branch and iterator graphs are processed from a worklist.
    pub fn validate_definition_with_cap(
        definition: &Definition,
        max_backoff_seconds: f64,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();

        if definition.name.trim().is_empty() {
            result.add_error("Name", "definition name cannot be empty");
        }

        if definition.timeout_seconds == Some(0) {
            result.add_error("TimeoutSeconds", "TimeoutSeconds must be greater than 0");
        }
        check_duration(&mut result, "TimeoutSeconds", definition.timeout_seconds);

        let mut worklist: VecDeque<(String, &StateGraph)> = VecDeque::new();
        worklist.push_back((String::new(), &definition.graph));

        while let Some((prefix, graph)) = worklist.pop_front() {
            Self::validate_graph(&prefix, graph, max_backoff_seconds, &mut result);

            for (name, state) in &graph.states {
                let location = state_location(&prefix, name);
                match &state.kind {
                    StateKind::Parallel(parallel) => {
                        for (index, branch) in parallel.branches.iter().enumerate() {
                            worklist.push_back((format!("{}.Branches[{}].", location, index), branch));
                        }
                    }
                    StateKind::Map(map) => {
                        worklist.push_back((format!("{}.Iterator.", location), &map.iterator));
                    }
                    _ => {}
                }
            }
        }

        result
    }

    fn validate_graph(
        prefix: &str,
        graph: &StateGraph,
        max_backoff_seconds: f64,
        result: &mut ValidationResult,
    ) {
        if graph.states.is_empty() {
            result.add_error(format!("{}States", prefix), "States cannot be empty");
        }

        if graph.start_at.is_empty() {
            result.add_error(format!("{}StartAt", prefix), "StartAt is required");
        } else if !graph.states.contains_key(&graph.start_at) {
            result.add_error(
                format!("{}StartAt", prefix),
                format!("start state '{}' not found in States", graph.start_at),
            );
        }

        for (name, state) in &graph.states {
            let location = state_location(prefix, name);
            Self::validate_state(&location, state, graph, max_backoff_seconds, result);
        }

        if graph.states.contains_key(&graph.start_at) {
            let reachable = graph.reachable();
            for name in graph.states.keys() {
                if !reachable.contains(name) {
                    result.add_warning(format!(
                        "state '{}' is unreachable from '{}'",
                        state_location(prefix, name),
                        graph.start_at
                    ));
                }
            }
        }
    }

    fn validate_state(
        location: &str,
        state: &State,
        graph: &StateGraph,
        max_backoff_seconds: f64,
        result: &mut ValidationResult,
    ) {
        let check_target = |result: &mut ValidationResult, field: &str, target: &str| {
            if !graph.states.contains_key(target) {
                result.add_error(
                    format!("{}.{}", location, field),
                    format!("transition target '{}' not found", target),
                );
            }
        };
        let check_path = |result: &mut ValidationResult, field: &str, value: Option<&str>| {
            if let Some(value) = value {
                if let Err(message) = path::parse_path(value) {
                    result.add_error(format!("{}.{}", location, field), message);
                }
            }
        };

        // Transition shape
        let terminal_kind = matches!(
            state.kind,
            StateKind::Choice(_) | StateKind::Succeed | StateKind::Fail(_)
        );
        match (&state.transition, terminal_kind) {
            (Some(_), true) => result.add_error(
                format!("{}.Next", location),
                format!("{} states cannot declare Next or End", state.state_type()),
            ),
            (None, false) => result.add_error(
                format!("{}.Next", location),
                format!("{} states require Next or End", state.state_type()),
            ),
            (Some(Transition::Next(next)), false) => check_target(result, "Next", next),
            _ => {}
        }

        check_path(result, "InputPath", state.input_path.as_deref());
        check_path(result, "OutputPath", state.output_path.as_deref());

        match &state.kind {
            StateKind::Task(task) => {
                if task.resource.trim().is_empty() {
                    result.add_error(
                        format!("{}.Resource", location),
                        "Task states require a Resource",
                    );
                } else if task.resource.strip_prefix("event:") == Some("") {
                    result.add_error(
                        format!("{}.Resource", location),
                        "event resources must name an event type",
                    );
                }
                if task.timeout_seconds == Some(0) {
                    result.add_error(
                        format!("{}.TimeoutSeconds", location),
                        "TimeoutSeconds must be greater than 0",
                    );
                }
                check_duration(result, &format!("{}.TimeoutSeconds", location), task.timeout_seconds);
                check_path(result, "ResultPath", task.result_path.as_deref());
                if let Some(parameters) = &task.parameters {
                    for template_path in path::template_paths(parameters) {
                        check_path(result, "Parameters", Some(&template_path));
                    }
                }
            }
            StateKind::Choice(choice) => {
                if choice.rules.is_empty() && choice.default.is_none() {
                    result.add_error(
                        format!("{}.Choices", location),
                        "Choice states require at least one rule or a Default",
                    );
                }
                for (index, rule) in choice.rules.iter().enumerate() {
                    let rule_location = format!("Choices[{}]", index);
                    check_target(result, &format!("{}.Next", rule_location), &rule.next);
                    Self::validate_condition(
                        &format!("{}.{}", location, rule_location),
                        &rule.condition,
                        result,
                    );
                }
                if let Some(default) = &choice.default {
                    check_target(result, "Default", default);
                }
            }
            StateKind::Parallel(parallel) => {
                if parallel.branches.is_empty() {
                    result.add_error(
                        format!("{}.Branches", location),
                        "Parallel states require at least one branch",
                    );
                }
                check_path(result, "ResultPath", parallel.result_path.as_deref());
            }
            StateKind::Wait(wait) => match wait {
                WaitSpec::SecondsPath(p) => check_path(result, "SecondsPath", Some(p)),
                WaitSpec::TimestampPath(p) => check_path(result, "TimestampPath", Some(p)),
                WaitSpec::Seconds(seconds) => {
                    check_duration(result, &format!("{}.Seconds", location), Some(*seconds))
                }
                WaitSpec::Timestamp(_) => {}
            },
            StateKind::Map(map) => {
                check_path(result, "ItemsPath", Some(&map.items_path));
                check_path(result, "ResultPath", map.result_path.as_deref());
            }
            StateKind::Pass(pass) => {
                check_path(result, "ResultPath", pass.result_path.as_deref());
            }
            StateKind::Succeed | StateKind::Fail(_) => {}
        }

        for (index, rule) in state.retry.iter().enumerate() {
            let retry_location = format!("{}.Retry[{}]", location, index);
            let rule_result = Self::validate_retry_rule(rule, &retry_location, max_backoff_seconds);
            result.errors.extend(rule_result.errors);
            result.warnings.extend(rule_result.warnings);

            if rule.error_equals.iter().any(|e| e == ERROR_ALL)
                && (rule.error_equals.len() > 1 || index + 1 != state.retry.len())
            {
                result.add_error(
                    format!("{}.ErrorEquals", retry_location),
                    format!("{} must appear alone in the last retrier", ERROR_ALL),
                );
            }
        }

        for (index, catcher) in state.catch.iter().enumerate() {
            let catch_location = format!("Catch[{}]", index);
            if catcher.error_equals.is_empty() {
                result.add_error(
                    format!("{}.{}.ErrorEquals", location, catch_location),
                    "ErrorEquals must list at least one error name",
                );
            }
            if catcher.error_equals.iter().any(|e| e == ERROR_ALL)
                && (catcher.error_equals.len() > 1 || index + 1 != state.catch.len())
            {
                result.add_error(
                    format!("{}.{}.ErrorEquals", location, catch_location),
                    format!("{} must appear alone in the last catcher", ERROR_ALL),
                );
            }
            check_target(result, &format!("{}.Next", catch_location), &catcher.next);
            check_path(
                result,
                &format!("{}.ResultPath", catch_location),
                catcher.result_path.as_deref(),
            );
        }

        if let Some(approval) = &state.approval {
            Self::validate_approval(location, state, approval, graph, result);
        }
    }

    fn validate_approval(
        location: &str,
        state: &State,
        approval: &ApprovalConfig,
        graph: &StateGraph,
        result: &mut ValidationResult,
    ) {
        if !matches!(state.kind, StateKind::Task(_) | StateKind::Pass(_)) {
            result.add_error(
                format!("{}.Approval", location),
                format!("approval gates are not supported on {} states", state.state_type()),
            );
        }
        if approval.role.trim().is_empty() {
            result.add_error(format!("{}.Approval.Role", location), "Role is required");
        }
        match approval.on_rejection {
            RejectionPolicy::Escalate if approval.escalation_role.is_none() => {
                result.add_error(
                    format!("{}.Approval.EscalationRole", location),
                    "OnRejection 'escalate' requires an EscalationRole",
                );
            }
            RejectionPolicy::AlternatePath if approval.alternate_state.is_none() => {
                result.add_error(
                    format!("{}.Approval.AlternateState", location),
                    "OnRejection 'alternate_path' requires an AlternateState",
                );
            }
            _ => {}
        }
        if let Some(alternate) = &approval.alternate_state {
            if !graph.states.contains_key(alternate) {
                result.add_error(
                    format!("{}.Approval.AlternateState", location),
                    format!("transition target '{}' not found", alternate),
                );
            }
            if approval.on_rejection != RejectionPolicy::AlternatePath {
                result.add_warning(format!(
                    "{}: AlternateState is ignored unless OnRejection is 'alternate_path'",
                    location
                ));
            }
        }
    }

    fn validate_condition(location: &str, condition: &Condition, result: &mut ValidationResult) {
        let mut worklist = vec![(location.to_string(), condition)];
        while let Some((location, condition)) = worklist.pop() {
            match condition {
                Condition::Compare { variable, .. } => {
                    if let Err(message) = path::parse_path(variable) {
                        result.add_error(format!("{}.Variable", location), message);
                    }
                }
                Condition::And(inner) | Condition::Or(inner) => {
                    let operator = if matches!(condition, Condition::And(_)) {
                        "And"
                    } else {
                        "Or"
                    };
                    if inner.is_empty() {
                        result.add_error(
                            format!("{}.{}", location, operator),
                            format!("{} requires at least one condition", operator),
                        );
                    }
                    for (index, nested) in inner.iter().enumerate() {
                        worklist.push((format!("{}.{}[{}]", location, operator, index), nested));
                    }
                }
                Condition::Not(inner) => worklist.push((format!("{}.Not", location), inner)),
            }
        }
    }
}

fn check_duration(result: &mut ValidationResult, location: &str, seconds: Option<u64>) {
    if let Some(seconds) = seconds.filter(|s| *s > MAX_DURATION_SECONDS) {
        result.add_error(
            location,
            format!("{} seconds exceeds the maximum of {}", seconds, MAX_DURATION_SECONDS),
        );
    }
}

/// Location of a state inside a (possibly nested) graph
fn state_location(prefix: &str, name: &str) -> String {
    format!("{}States.{}", prefix, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(interval: u64, attempts: u32, rate: f64) -> RetryRule {
        RetryRule {
            error_equals: vec![ERROR_ALL.to_string()],
            interval_seconds: interval,
            max_attempts: attempts,
            backoff_rate: rate,
        }
    }

    #[test]
    fn test_validate_retry_rule_valid() {
        let result = WorkflowValidator::validate_retry_rule(&rule(2, 3, 2.0), "Retry[0]", 600.0);
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_validate_retry_rule_reports_every_problem() {
        let mut bad = rule(0, 150, 0.5);
        bad.error_equals.clear();
        let result = WorkflowValidator::validate_retry_rule(&bad, "Retry[0]", 600.0);
        assert_eq!(result.errors.len(), 4);
        assert!(result.errors.iter().any(|e| e.message.contains("at least 1")));
        assert!(result.errors.iter().any(|e| e.message.contains("cannot exceed 99")));
        assert!(result.errors.iter().any(|e| e.message.contains("at least 1.0")));
    }

    #[test]
    fn test_validate_retry_rule_cap_warning() {
        let result = WorkflowValidator::validate_retry_rule(&rule(100, 5, 3.0), "Retry[0]", 600.0);
        assert!(result.is_valid());
        assert!(result.warnings[0].contains("capped at 600s"));
    }

    #[test]
    fn test_durations_beyond_the_maximum_are_errors() {
        let text = r#"{
            "StartAt": "Hold",
            "TimeoutSeconds": 100000000000000,
            "States": {
                "Hold": {"Type": "Wait", "Seconds": 100000000000000, "Next": "Call"},
                "Call": {"Type": "Task", "Resource": "svc:call", "TimeoutSeconds": 100000000, "End": true}
            }
        }"#;
        let error = crate::workflow::parser::parse_definition("long", text).unwrap_err();
        assert!(error.has_issue_at("TimeoutSeconds"), "{}", error);
        assert!(error.has_issue_at("States.Hold.Seconds"), "{}", error);
        assert!(error.has_issue_at("States.Call.TimeoutSeconds"), "{}", error);

        let ok = r#"{
            "StartAt": "Hold",
            "States": {"Hold": {"Type": "Wait", "Seconds": 99999999, "End": true}}
        }"#;
        assert!(crate::workflow::parser::parse_definition("long", ok).is_ok());
    }
}
