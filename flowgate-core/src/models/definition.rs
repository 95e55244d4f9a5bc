//! In-memory state machine definition model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Error name matching every error class in `ErrorEquals`
pub const ERROR_ALL: &str = "States.ALL";

/// Largest `Seconds`/`TimeoutSeconds` a definition or configuration may declare
pub const MAX_DURATION_SECONDS: u64 = 99_999_999;

/// Published, immutable state machine definition
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    /// Name the definition is published under
    pub name: String,
    /// Free-form description from the document
    pub comment: Option<String>,
    /// Version assigned at publish time (0 until published)
    pub version: u32,
    /// Global run timeout
    pub timeout_seconds: Option<u64>,
    /// Top-level state graph
    pub graph: StateGraph,
}

impl Definition {
    /// Resolve the (possibly nested) graph a cursor lives in
    pub fn graph_at(&self, path: &GraphPath) -> Option<&StateGraph> {
        let mut graph = &self.graph;
        for step in &path.0 {
            let state = graph.states.get(&step.state)?;
            graph = match (&state.kind, step.branch) {
                (StateKind::Parallel(parallel), Some(index)) => parallel.branches.get(index)?,
                (StateKind::Map(map), None) => &map.iterator,
                _ => return None,
            };
        }
        Some(graph)
    }

    /// Look up a state inside the graph at `path`
    pub fn state_at(&self, path: &GraphPath, state: &str) -> Option<&State> {
        self.graph_at(path)?.states.get(state)
    }
}

/// A graph of states with a designated start state
#[derive(Debug, Clone, PartialEq)]
pub struct StateGraph {
    pub start_at: String,
    pub states: BTreeMap<String, State>,
}

impl StateGraph {
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    /// States reachable from `start_at`, following every outgoing edge.
    ///
    /// Nested branch/iterator graphs are not entered; they are separate graphs.
    pub fn reachable(&self) -> BTreeSet<String> {
        let mut reachable = BTreeSet::new();
        let mut queue = VecDeque::from([self.start_at.clone()]);

        while let Some(name) = queue.pop_front() {
            let Some(state) = self.states.get(&name) else {
                continue;
            };
            if !reachable.insert(name) {
                continue;
            }
            for target in state.targets() {
                if !reachable.contains(target) {
                    queue.push_back(target.to_string());
                }
            }
        }

        reachable
    }
}

/// Outgoing transition of a non-terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(String),
    End,
}

/// A single state of a graph
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub name: String,
    pub comment: Option<String>,
    pub kind: StateKind,
    /// `None` for Choice, Succeed and Fail
    pub transition: Option<Transition>,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub retry: Vec<RetryRule>,
    pub catch: Vec<CatchRule>,
    pub approval: Option<ApprovalConfig>,
}

impl State {
    pub fn state_type(&self) -> StateType {
        self.kind.state_type()
    }

    /// Every state id this state may transfer control to within its own graph
    pub fn targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        if let Some(Transition::Next(next)) = &self.transition {
            targets.push(next.as_str());
        }
        if let StateKind::Choice(choice) = &self.kind {
            targets.extend(choice.rules.iter().map(|rule| rule.next.as_str()));
            if let Some(default) = &choice.default {
                targets.push(default.as_str());
            }
        }
        targets.extend(self.catch.iter().map(|catcher| catcher.next.as_str()));
        if let Some(alternate) = self
            .approval
            .as_ref()
            .and_then(|approval| approval.alternate_state.as_deref())
        {
            targets.push(alternate);
        }
        targets
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StateKind::Succeed | StateKind::Fail(_))
    }
}

/// Closed set of state types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    Task,
    Choice,
    Parallel,
    Wait,
    Map,
    Pass,
    Succeed,
    Fail,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Task => "Task",
            StateType::Choice => "Choice",
            StateType::Parallel => "Parallel",
            StateType::Wait => "Wait",
            StateType::Map => "Map",
            StateType::Pass => "Pass",
            StateType::Succeed => "Succeed",
            StateType::Fail => "Fail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "Task" => StateType::Task,
            "Choice" => StateType::Choice,
            "Parallel" => StateType::Parallel,
            "Wait" => StateType::Wait,
            "Map" => StateType::Map,
            "Pass" => StateType::Pass,
            "Succeed" => StateType::Succeed,
            "Fail" => StateType::Fail,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific state payload
#[derive(Debug, Clone, PartialEq)]
pub enum StateKind {
    Task(TaskSpec),
    Choice(ChoiceSpec),
    Parallel(ParallelSpec),
    Wait(WaitSpec),
    Map(MapSpec),
    Pass(PassSpec),
    Succeed,
    Fail(FailSpec),
}

impl StateKind {
    pub fn state_type(&self) -> StateType {
        match self {
            StateKind::Task(_) => StateType::Task,
            StateKind::Choice(_) => StateType::Choice,
            StateKind::Parallel(_) => StateType::Parallel,
            StateKind::Wait(_) => StateType::Wait,
            StateKind::Map(_) => StateType::Map,
            StateKind::Pass(_) => StateType::Pass,
            StateKind::Succeed => StateType::Succeed,
            StateKind::Fail(_) => StateType::Fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub resource: String,
    pub parameters: Option<Value>,
    pub result_path: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceSpec {
    pub rules: Vec<ChoiceRule>,
    pub default: Option<String>,
}

/// A top-level choice rule: condition plus target
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceRule {
    pub condition: Condition,
    pub next: String,
}

/// Boolean data condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        variable: String,
        comparison: Comparison,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

/// Comparator and its operand
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    NumericEquals(f64),
    NumericGreaterThan(f64),
    NumericLessThan(f64),
    NumericGreaterThanEquals(f64),
    NumericLessThanEquals(f64),
    StringEquals(String),
    BooleanEquals(bool),
    IsPresent(bool),
}

impl Comparison {
    /// Comparator field name in the document format
    pub fn operator(&self) -> &'static str {
        match self {
            Comparison::NumericEquals(_) => "NumericEquals",
            Comparison::NumericGreaterThan(_) => "NumericGreaterThan",
            Comparison::NumericLessThan(_) => "NumericLessThan",
            Comparison::NumericGreaterThanEquals(_) => "NumericGreaterThanEquals",
            Comparison::NumericLessThanEquals(_) => "NumericLessThanEquals",
            Comparison::StringEquals(_) => "StringEquals",
            Comparison::BooleanEquals(_) => "BooleanEquals",
            Comparison::IsPresent(_) => "IsPresent",
        }
    }

    /// Build a comparison from a document operator name and operand
    pub fn from_operator(operator: &str, operand: &Value) -> Option<Result<Self, String>> {
        let numeric = || {
            operand
                .as_f64()
                .ok_or_else(|| format!("{} requires a numeric operand", operator))
        };
        let comparison = match operator {
            "NumericEquals" => numeric().map(Comparison::NumericEquals),
            "NumericGreaterThan" => numeric().map(Comparison::NumericGreaterThan),
            "NumericLessThan" => numeric().map(Comparison::NumericLessThan),
            "NumericGreaterThanEquals" => numeric().map(Comparison::NumericGreaterThanEquals),
            "NumericLessThanEquals" => numeric().map(Comparison::NumericLessThanEquals),
            "StringEquals" => operand
                .as_str()
                .map(|s| Comparison::StringEquals(s.to_string()))
                .ok_or_else(|| "StringEquals requires a string operand".to_string()),
            "BooleanEquals" => operand
                .as_bool()
                .map(Comparison::BooleanEquals)
                .ok_or_else(|| "BooleanEquals requires a boolean operand".to_string()),
            "IsPresent" => operand
                .as_bool()
                .map(Comparison::IsPresent)
                .ok_or_else(|| "IsPresent requires a boolean operand".to_string()),
            _ => return None,
        };
        Some(comparison)
    }

    /// Operand as a document value
    pub fn operand(&self) -> Value {
        match self {
            Comparison::NumericEquals(n)
            | Comparison::NumericGreaterThan(n)
            | Comparison::NumericLessThan(n)
            | Comparison::NumericGreaterThanEquals(n)
            | Comparison::NumericLessThanEquals(n) => number_value(*n),
            Comparison::StringEquals(s) => Value::String(s.clone()),
            Comparison::BooleanEquals(b) | Comparison::IsPresent(b) => Value::Bool(*b),
        }
    }
}

/// Integral floats serialize back as integers so documents round-trip cleanly
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Comparator names accepted in choice rules
pub const COMPARATORS: &[&str] = &[
    "NumericEquals",
    "NumericGreaterThan",
    "NumericLessThan",
    "NumericGreaterThanEquals",
    "NumericLessThanEquals",
    "StringEquals",
    "BooleanEquals",
    "IsPresent",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelSpec {
    pub branches: Vec<StateGraph>,
    pub result_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitSpec {
    Seconds(u64),
    Timestamp(DateTime<Utc>),
    SecondsPath(String),
    TimestampPath(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapSpec {
    pub iterator: Box<StateGraph>,
    pub items_path: String,
    /// 0 means unbounded
    pub max_concurrency: u32,
    pub result_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassSpec {
    pub result: Option<Value>,
    pub parameters: Option<Value>,
    pub result_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailSpec {
    pub error: Option<String>,
    pub cause: Option<String>,
}

/// Retrier attached to a state
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRule {
    pub error_equals: Vec<String>,
    pub interval_seconds: u64,
    pub max_attempts: u32,
    pub backoff_rate: f64,
}

impl RetryRule {
    pub const DEFAULT_INTERVAL_SECONDS: u64 = 1;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BACKOFF_RATE: f64 = 2.0;

    pub fn matches(&self, error: &str) -> bool {
        error_matches(&self.error_equals, error)
    }

    /// Delay before retry number `attempt` (1-based), in seconds, capped at `max_seconds`
    pub fn delay_seconds(&self, attempt: u32, max_seconds: f64) -> f64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.interval_seconds as f64 * self.backoff_rate.powi(exponent);
        delay.min(max_seconds)
    }
}

/// Catcher attached to a state
#[derive(Debug, Clone, PartialEq)]
pub struct CatchRule {
    pub error_equals: Vec<String>,
    pub next: String,
    pub result_path: Option<String>,
}

impl CatchRule {
    pub fn matches(&self, error: &str) -> bool {
        error_matches(&self.error_equals, error)
    }
}

fn error_matches(error_equals: &[String], error: &str) -> bool {
    error_equals
        .iter()
        .any(|candidate| candidate == ERROR_ALL || candidate == error)
}

/// Human approval gate on a state
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalConfig {
    pub role: String,
    pub description: Option<String>,
    pub on_rejection: RejectionPolicy,
    pub escalation_role: Option<String>,
    pub alternate_state: Option<String>,
}

/// What a rejected approval does to the cursor
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Fail the run
    #[default]
    Terminate,
    /// Proceed to `Next` as if approved, skipping the state's action
    Continue,
    /// Hand the decision to the escalation role
    Escalate,
    /// Redirect to the configured alternate state
    AlternatePath,
}

impl RejectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionPolicy::Terminate => "terminate",
            RejectionPolicy::Continue => "continue",
            RejectionPolicy::Escalate => "escalate",
            RejectionPolicy::AlternatePath => "alternate_path",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "terminate" => RejectionPolicy::Terminate,
            "continue" => RejectionPolicy::Continue,
            "escalate" => RejectionPolicy::Escalate,
            "alternate_path" => RejectionPolicy::AlternatePath,
            _ => return None,
        })
    }
}

/// One level of graph nesting: the Parallel branch or Map iterator entered at `state`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphStep {
    pub state: String,
    /// Branch index for Parallel; `None` for a Map iterator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<usize>,
}

/// Location of a nested graph, from the root graph inwards
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphPath(pub Vec<GraphStep>);

impl GraphPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn branch(&self, state: &str, index: usize) -> Self {
        let mut steps = self.0.clone();
        steps.push(GraphStep {
            state: state.to_string(),
            branch: Some(index),
        });
        Self(steps)
    }

    pub fn iterator(&self, state: &str) -> Self {
        let mut steps = self.0.clone();
        steps.push(GraphStep {
            state: state.to_string(),
            branch: None,
        });
        Self(steps)
    }
}

impl std::fmt::Display for GraphPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("$")?;
        for step in &self.0 {
            match step.branch {
                Some(index) => write!(f, "/{}[{}]", step.state, index)?,
                None => write!(f, "/{}[*]", step.state)?,
            }
        }
        Ok(())
    }
}
