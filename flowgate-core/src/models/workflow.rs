//! Run, approval, escalation and audit records

use crate::models::definition::GraphPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no step taken yet
    Pending,
    /// At least one step taken, not terminal
    Running,
    /// Every cursor reached a terminal state successfully
    Completed,
    /// Unrecoverable error or Fail state
    Failed,
    /// Cancelled by an operator
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// SLA urgency classification of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    OnTime,
    AtRisk,
    Overdue,
    Escalated,
    /// Run finished; reachable from any status
    Completed,
}

impl SlaStatus {
    /// Severity rank; `Completed` sits outside the ordering
    pub fn severity(&self) -> Option<u8> {
        match self {
            SlaStatus::OnTime => Some(0),
            SlaStatus::AtRisk => Some(1),
            SlaStatus::Overdue => Some(2),
            SlaStatus::Escalated => Some(3),
            SlaStatus::Completed => None,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic
    pub fn allows(&self, next: SlaStatus) -> bool {
        match (self.severity(), next.severity()) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(current), Some(next)) => next >= current,
        }
    }
}

/// Failure recorded on a failed run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunFailure {
    /// Error name (e.g. `States.TaskFailed`, `ApprovalRejected`)
    pub error: String,
    /// Human-readable cause
    pub cause: String,
    /// State that raised the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Executing instance of a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier
    pub id: Uuid,
    /// Name of the definition this run was created from
    pub definition: String,
    /// Definition version pinned at creation
    pub definition_version: u32,
    /// Working data of the root scope
    pub data: Value,
    /// Overall run status
    pub status: RunStatus,
    /// Active positions in the state graph
    #[serde(default)]
    pub cursors: Vec<Cursor>,
    /// Open fork/join barriers keyed by group id
    #[serde(default)]
    pub join_groups: BTreeMap<Uuid, JoinGroup>,
    /// Identity that created the run
    pub initiator: String,
    /// When the run was created
    pub created_at: DateTime<Utc>,
    /// Last time the run record changed
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// SLA deadline
    pub sla_deadline: DateTime<Utc>,
    /// SLA classification
    pub sla_status: SlaStatus,
    /// Set when the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl Run {
    pub fn new(
        definition: &str,
        definition_version: u32,
        data: Value,
        initiator: String,
        now: DateTime<Utc>,
        sla_deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition: definition.to_string(),
            definition_version,
            data,
            status: RunStatus::Pending,
            cursors: Vec::new(),
            join_groups: BTreeMap::new(),
            initiator,
            created_at: now,
            updated_at: now,
            completed_at: None,
            sla_deadline,
            sla_status: SlaStatus::OnTime,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn cursor(&self, id: Uuid) -> Option<&Cursor> {
        self.cursors.iter().find(|c| c.id == id)
    }

    pub fn cursor_mut(&mut self, id: Uuid) -> Option<&mut Cursor> {
        self.cursors.iter_mut().find(|c| c.id == id)
    }

    /// Remove a cursor, returning it
    pub fn take_cursor(&mut self, id: Uuid) -> Option<Cursor> {
        let index = self.cursors.iter().position(|c| c.id == id)?;
        Some(self.cursors.remove(index))
    }

    /// Earliest time a waiting cursor becomes due
    pub fn next_resume_at(&self) -> Option<DateTime<Utc>> {
        self.cursors
            .iter()
            .filter_map(|c| match &c.status {
                CursorStatus::Waiting { resume_at, .. } => Some(*resume_at),
                _ => None,
            })
            .min()
    }

    /// State the run is "at" for reporting: the first suspended or root cursor
    pub fn current_state(&self) -> Option<&str> {
        self.cursors
            .iter()
            .find(|c| matches!(c.status, CursorStatus::AwaitingApproval { .. }))
            .or_else(|| self.cursors.iter().find(|c| c.graph.is_root()))
            .or_else(|| self.cursors.first())
            .map(|c| c.state.as_str())
    }
}

/// Why a cursor is waiting on the clock
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// A Wait state; on resume the cursor leaves the state
    WaitState,
    /// Retry backoff; on resume the state is executed again
    Retry,
}

/// Scheduling status of a cursor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CursorStatus {
    /// Can be stepped now
    Ready,
    /// Suspended until `resume_at`
    Waiting {
        resume_at: DateTime<Utc>,
        reason: WaitReason,
    },
    /// Suspended on a human decision
    AwaitingApproval { task_id: Uuid },
    /// Suspended until an external event is injected
    AwaitingEvent { event_type: String },
    /// Parked on a fork until all children arrive
    AwaitingJoin { group_id: Uuid },
}

/// Membership of a child cursor in a join group
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinSlot {
    pub group_id: Uuid,
    /// Branch index (Parallel) or item index (Map)
    pub slot: usize,
}

/// Position of one line of execution inside a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    /// Unique cursor identifier
    pub id: Uuid,
    /// Graph the cursor is walking
    #[serde(default)]
    pub graph: GraphPath,
    /// Current state id within `graph`
    pub state: String,
    /// Data flowing into the current state
    pub data: Value,
    /// Scheduling status
    #[serde(flatten)]
    pub status: CursorStatus,
    /// Attempts consumed per retrier index for the current state
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retry_counts: BTreeMap<usize, u32>,
    /// Approval gate of the current state already passed
    #[serde(default)]
    pub approval_granted: bool,
    /// Set for children of a Parallel/Map fork
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSlot>,
    /// When the cursor entered its current state
    pub entered_at: DateTime<Utc>,
}

impl Cursor {
    pub fn new(graph: GraphPath, state: &str, data: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            graph,
            state: state.to_string(),
            data,
            status: CursorStatus::Ready,
            retry_counts: BTreeMap::new(),
            approval_granted: false,
            join: None,
            entered_at: now,
        }
    }

    /// Move to another state of the same graph, clearing per-state bookkeeping
    pub fn enter(&mut self, state: &str, data: Value, now: DateTime<Utc>) {
        self.state = state.to_string();
        self.data = data;
        self.status = CursorStatus::Ready;
        self.retry_counts.clear();
        self.approval_granted = false;
        self.entered_at = now;
    }

    pub fn is_ready(&self) -> bool {
        self.status == CursorStatus::Ready
    }
}

/// Kind of fork a join group belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Parallel,
    Map,
}

/// Map item not yet started
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingItem {
    pub index: usize,
    pub value: Value,
}

/// Join barrier for the children of one Parallel/Map fork
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinGroup {
    /// Group identifier shared by all children
    pub id: Uuid,
    /// Parked parent cursor
    pub parent: Uuid,
    /// Parallel or Map
    pub kind: JoinKind,
    /// Children that have not arrived yet (started or pending)
    pub remaining: usize,
    /// Child outputs by slot
    pub results: Vec<Value>,
    /// Map items waiting for a concurrency slot
    #[serde(default)]
    pub pending: VecDeque<PendingItem>,
    /// Live child cursors
    pub active: usize,
    /// Bound on live children (0 = unbounded)
    pub max_concurrency: usize,
    /// Highest number of simultaneously live children observed
    pub peak_active: usize,
}

impl JoinGroup {
    pub fn new(parent: Uuid, kind: JoinKind, slots: usize, max_concurrency: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent,
            kind,
            remaining: slots,
            results: vec![Value::Null; slots],
            pending: VecDeque::new(),
            active: 0,
            max_concurrency,
            peak_active: 0,
        }
    }

    /// Whether another child may start now
    pub fn has_capacity(&self) -> bool {
        self.max_concurrency == 0 || self.active < self.max_concurrency
    }

    /// Record a child start
    pub fn start_child(&mut self) {
        self.active += 1;
        self.peak_active = self.peak_active.max(self.active);
    }

    /// Record a child arrival; returns `true` exactly once, for the last arrival
    pub fn arrive(&mut self, slot: usize, output: Value) -> bool {
        if let Some(result) = self.results.get_mut(slot) {
            *result = output;
        }
        self.active = self.active.saturating_sub(1);
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.remaining == 0
    }
}

/// Human decision on an approval task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "approved" | "approve" => Some(Decision::Approved),
            "rejected" | "reject" => Some(Decision::Rejected),
            _ => None,
        }
    }
}

/// Approval task status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a decision
    Pending,
    /// Decision: approved
    Approved,
    /// Decision: rejected
    Rejected,
    /// Closed without a decision: a gate task on the same state took it over
    Superseded,
}

/// What created an approval task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOrigin {
    /// Approval gate configured on a state
    StateGate,
    /// Review raised by the SLA monitor
    SlaEscalation,
}

/// Durable suspension point for a human decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTask {
    /// Unique task identifier
    pub id: Uuid,
    /// Run the task belongs to
    pub run_id: Uuid,
    /// State the decision is about
    pub state_id: String,
    /// Role allowed to decide
    pub role: String,
    /// Current status
    pub status: ApprovalStatus,
    /// Why the task exists
    pub origin: ApprovalOrigin,
    /// Cursor suspended on this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_id: Option<Uuid>,
    /// Description shown to the decider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Task this one was escalated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_from: Option<Uuid>,
    /// Identity that decided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    /// Decision comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// When the task was created
    pub requested_at: DateTime<Utc>,
    /// When the decision was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalTask {
    pub fn new(
        run_id: Uuid,
        state_id: &str,
        role: &str,
        origin: ApprovalOrigin,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            state_id: state_id.to_string(),
            role: role.to_string(),
            status: ApprovalStatus::Pending,
            origin,
            cursor_id: None,
            description: None,
            escalated_from: None,
            decided_by: None,
            comment: None,
            requested_at: now,
            decided_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// Why an escalation was raised
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Rejection,
    SlaBreach,
}

/// Escalation status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    Resolved,
}

/// Re-routing of a decision to a fallback role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    /// Unique escalation identifier
    pub id: Uuid,
    /// Run the escalation belongs to
    pub run_id: Uuid,
    /// State the escalation concerns
    pub state_id: String,
    /// Role the decision came from
    pub from_role: String,
    /// Role the decision moved to
    pub to_role: String,
    /// Rejection routing or SLA breach
    pub reason: EscalationReason,
    /// Open until the target task is decided
    pub status: EscalationStatus,
    /// Task that triggered the escalation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task: Option<Uuid>,
    /// Task created for the target role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_task: Option<Uuid>,
    /// When the escalation was raised
    pub created_at: DateTime<Utc>,
}

/// Audited action names
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RunCreated,
    RunStarted,
    StepSucceeded,
    StepFailed,
    RetryScheduled,
    CatchRouted,
    StepFailureUnhandled,
    BranchesForked,
    JoinReleased,
    WaitScheduled,
    WaitElapsed,
    EventAwaited,
    EventDelivered,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    Escalated,
    SlaStatusChanged,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RunCreated => "run_created",
            AuditAction::RunStarted => "run_started",
            AuditAction::StepSucceeded => "step_succeeded",
            AuditAction::StepFailed => "step_failed",
            AuditAction::RetryScheduled => "retry_scheduled",
            AuditAction::CatchRouted => "catch_routed",
            AuditAction::StepFailureUnhandled => "step_failure_unhandled",
            AuditAction::BranchesForked => "branches_forked",
            AuditAction::JoinReleased => "join_released",
            AuditAction::WaitScheduled => "wait_scheduled",
            AuditAction::WaitElapsed => "wait_elapsed",
            AuditAction::EventAwaited => "event_awaited",
            AuditAction::EventDelivered => "event_delivered",
            AuditAction::ApprovalRequested => "approval_requested",
            AuditAction::ApprovalApproved => "approval_approved",
            AuditAction::ApprovalRejected => "approval_rejected",
            AuditAction::Escalated => "escalated",
            AuditAction::SlaStatusChanged => "sla_status_changed",
            AuditAction::RunCompleted => "run_completed",
            AuditAction::RunFailed => "run_failed",
            AuditAction::RunCancelled => "run_cancelled",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry ID
    pub id: Uuid,
    /// Store-assigned sequence number (0 until appended)
    #[serde(default)]
    pub sequence: u64,
    /// Run the entry belongs to
    pub run_id: Uuid,
    /// State involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
    /// What happened
    pub action: AuditAction,
    /// Who caused it (`engine`, `sla-monitor`, or a user)
    pub actor: String,
    /// Structured detail
    #[serde(default)]
    pub detail: Value,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_serialization() {
        let status = RunStatus::Running;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"running\"");
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_sla_status_monotonic() {
        assert!(SlaStatus::OnTime.allows(SlaStatus::AtRisk));
        assert!(SlaStatus::AtRisk.allows(SlaStatus::AtRisk));
        assert!(!SlaStatus::Overdue.allows(SlaStatus::AtRisk));
        assert!(!SlaStatus::Escalated.allows(SlaStatus::OnTime));
        assert!(SlaStatus::Escalated.allows(SlaStatus::Completed));
        assert!(!SlaStatus::Completed.allows(SlaStatus::OnTime));
    }

    #[test]
    fn test_join_group_fires_once() {
        let mut group = JoinGroup::new(Uuid::new_v4(), JoinKind::Parallel, 2, 0);
        group.start_child();
        group.start_child();
        assert!(!group.arrive(1, serde_json::json!("b")));
        assert!(group.arrive(0, serde_json::json!("a")));
        assert!(!group.arrive(0, serde_json::json!("late")));
        assert_eq!(group.peak_active, 2);
    }

    #[test]
    fn test_cursor_status_round_trip() {
        let cursor = Cursor {
            status: CursorStatus::AwaitingEvent {
                event_type: "payment.received".to_string(),
            },
            ..Cursor::new(GraphPath::root(), "Wait", serde_json::json!({}), Utc::now())
        };
        let json = serde_json::to_value(&cursor).unwrap();
        assert_eq!(json["status"], "awaiting_event");
        let back: Cursor = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, cursor.status);
    }

    #[test]
    fn test_decision_parse() {
        assert_eq!(Decision::parse("Approved"), Some(Decision::Approved));
        assert_eq!(Decision::parse("reject"), Some(Decision::Rejected));
        assert_eq!(Decision::parse("maybe"), None);
    }
}
