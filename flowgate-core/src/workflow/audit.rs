//! Audit entries and their tracing mirror

use crate::models::workflow::{AuditAction, AuditEntry};
use crate::workflow::store::StoreOp;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Actor recorded for interpreter steps
pub const ACTOR_ENGINE: &str = "engine";
/// Actor recorded for SLA monitor actions
pub const ACTOR_SLA_MONITOR: &str = "sla-monitor";
/// Actor recorded for scheduler wake-ups and timeouts
pub const ACTOR_SCHEDULER: &str = "scheduler";

impl AuditEntry {
    /// Create new audit entry; the sequence number is assigned by the store
    pub fn new(run_id: Uuid, action: AuditAction, actor: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            run_id,
            state_id: None,
            action,
            actor: actor.to_string(),
            detail: Value::Null,
            timestamp,
        }
    }

    pub fn at_state(mut self, state: impl Into<String>) -> Self {
        self.state_id = Some(state.into());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// Whether this entry records a failure or escalation
    pub fn is_alarm(&self) -> bool {
        matches!(
            self.action,
            AuditAction::StepFailureUnhandled
                | AuditAction::RunFailed
                | AuditAction::Escalated
                | AuditAction::ApprovalRejected
        )
    }
}

/// Mirror an audit entry as a tracing event
pub fn trace_entry(entry: &AuditEntry) {
    let state = entry.state_id.as_deref().unwrap_or("-");
    if entry.is_alarm() {
        tracing::warn!(
            run_id = %entry.run_id,
            state = state,
            action = %entry.action,
            actor = %entry.actor,
            detail = %entry.detail,
            "audit"
        );
    } else {
        tracing::info!(
            run_id = %entry.run_id,
            state = state,
            action = %entry.action,
            actor = %entry.actor,
            detail = %entry.detail,
            "audit"
        );
    }
}

/// Mirror every audit entry of a committed batch
pub fn trace_batch(batch: &[StoreOp]) {
    for op in batch {
        if let StoreOp::AppendAudit(entry) = op {
            trace_entry(entry);
        }
    }
}

/// Entries of `entries` with the given action
pub fn entries_with<'a>(entries: &'a [AuditEntry], action: AuditAction) -> Vec<&'a AuditEntry> {
    entries.iter().filter(|e| e.action == action).collect()
}
