//! Workflow error taxonomy

use thiserror::Error;
use uuid::Uuid;

/// Error name raised by a failing resource call
pub const ERROR_TASK_FAILED: &str = "States.TaskFailed";
/// Error name raised when a task or run exceeds its timeout
pub const ERROR_TIMEOUT: &str = "States.Timeout";
/// Error name raised for data/path problems at run time
pub const ERROR_RUNTIME: &str = "States.Runtime";
/// Error name raised when no choice rule matched and no Default exists
pub const ERROR_NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
/// Error name of a Fail state that declares no `Error`
pub const ERROR_FAIL_STATE: &str = "States.Fail";
/// Error name recorded when an approval rejection terminates a run
pub const ERROR_APPROVAL_REJECTED: &str = "ApprovalRejected";
/// Error name recorded when an SLA escalation review is rejected
pub const ERROR_SLA_ESCALATION_REJECTED: &str = "SlaEscalationRejected";

/// One violated definition invariant
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationIssue {
    /// Location inside the document, e.g. `States.Approve.Next`
    pub location: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Definition rejected at publish/parse time; lists every issue found
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid definition ({} issue(s)): {}", .issues.len(), join_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn single(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ValidationIssue {
                location: location.into(),
                message: message.into(),
            }],
        }
    }

    /// Whether any issue is reported at `location`
    pub fn has_issue_at(&self, location: &str) -> bool {
        self.issues.iter().any(|issue| issue.location == location)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure of an external resource call (or a run-time data error on a state)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error}: {cause}")]
pub struct ResourceError {
    /// Error class matched against `ErrorEquals`
    pub error: String,
    /// Human-readable cause
    pub cause: String,
}

impl ResourceError {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }

    pub fn task_failed(cause: impl Into<String>) -> Self {
        Self::new(ERROR_TASK_FAILED, cause)
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        Self::new(ERROR_TIMEOUT, cause)
    }

    pub fn runtime(cause: impl Into<String>) -> Self {
        Self::new(ERROR_RUNTIME, cause)
    }

    /// Error detail object merged into data by catchers
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "Error": self.error, "Cause": self.cause })
    }
}

/// Persistent store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed: {0:#}")]
    Io(anyhow::Error),

    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors surfaced by the workflow core
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no transition from state '{state}': {message}")]
    Transition { state: String, message: String },

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("approval rejected at state '{state}'")]
    ApprovalRejected { state: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("SLA breached for run {run_id}")]
    SlaBreach { run_id: Uuid },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for WorkflowError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(message) => WorkflowError::Conflict(message),
            StoreError::NotFound(what) => WorkflowError::NotFound(what),
            other => WorkflowError::Store(other),
        }
    }
}

pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_issue() {
        let error = ValidationError {
            issues: vec![
                ValidationIssue {
                    location: "StartAt".to_string(),
                    message: "missing".to_string(),
                },
                ValidationIssue {
                    location: "States.A.Next".to_string(),
                    message: "unknown target 'B'".to_string(),
                },
            ],
        };
        let text = error.to_string();
        assert!(text.contains("2 issue(s)"));
        assert!(text.contains("StartAt: missing"));
        assert!(text.contains("States.A.Next: unknown target 'B'"));
        assert!(error.has_issue_at("StartAt"));
    }

    #[test]
    fn test_store_conflict_maps_to_conflict() {
        let error: WorkflowError = StoreError::Conflict("task already decided".into()).into();
        assert!(matches!(error, WorkflowError::Conflict(_)));
    }
}
