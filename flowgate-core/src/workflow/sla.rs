//! SLA monitor: classifies runs against their deadline and escalates overdue ones

use crate::models::configuration::SlaConfiguration;
use crate::models::workflow::{
    ApprovalOrigin, ApprovalTask, AuditAction, CursorStatus, Escalation, EscalationReason,
    EscalationStatus, SlaStatus,
};
use crate::workflow::audit::ACTOR_SLA_MONITOR;
use crate::workflow::interpreter::Transaction;
use crate::workflow::store::StoreOp;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

/// Role recorded as the escalation source when nobody holds a pending decision
pub const SYSTEM_ROLE: &str = "system";

/// Thresholds the monitor classifies against
#[derive(Debug, Clone)]
pub struct SlaPolicy {
    /// Time before the deadline that counts as at risk
    pub at_risk_window: Duration,
    /// Role overdue runs are escalated to
    pub escalation_role: String,
}

impl SlaPolicy {
    pub fn from_config(config: &SlaConfiguration) -> Self {
        Self {
            at_risk_window: i64::try_from(config.at_risk_window_seconds)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX),
            escalation_role: config.escalation_role.clone(),
        }
    }
}

/// What one evaluation did to a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaOutcome {
    /// Number of status changes recorded
    pub transitions: usize,
    /// The run was escalated by this evaluation
    pub escalated: bool,
}

/// Classify `now` against `deadline`
pub fn classify(now: DateTime<Utc>, deadline: DateTime<Utc>, at_risk_window: Duration) -> SlaStatus {
    if now >= deadline {
        SlaStatus::Overdue
    } else if deadline.checked_sub_signed(at_risk_window).map_or(true, |start| now >= start) {
        SlaStatus::AtRisk
    } else {
        SlaStatus::OnTime
    }
}

fn change_status(tx: &mut Transaction, to: SlaStatus) {
    let from = tx.run.sla_status;
    tx.run.sla_status = to;
    tx.audit(
        None,
        AuditAction::SlaStatusChanged,
        ACTOR_SLA_MONITOR,
        json!({ "from": from, "to": to, "deadline": tx.run.sla_deadline }),
    );
}

/// Evaluate one non-terminal run.
///
/// `tasks` are the run's approval tasks as currently stored.
pub fn evaluate(policy: &SlaPolicy, tx: &mut Transaction, tasks: &[ApprovalTask]) -> SlaOutcome {
    let mut outcome = SlaOutcome::default();
    let current = tx.run.sla_status;
    if tx.run.is_terminal() || matches!(current, SlaStatus::Escalated | SlaStatus::Completed) {
        return outcome;
    }

    let target = classify(tx.now, tx.run.sla_deadline, policy.at_risk_window);
    if target == current || !current.allows(target) {
        return outcome;
    }

    change_status(tx, target);
    outcome.transitions += 1;

    if target == SlaStatus::Overdue {
        escalate_overdue(policy, tx, tasks);
        change_status(tx, SlaStatus::Escalated);
        outcome.transitions += 1;
        outcome.escalated = true;
    }
    outcome
}

fn escalate_overdue(policy: &SlaPolicy, tx: &mut Transaction, tasks: &[ApprovalTask]) {
    let awaited: Vec<Uuid> = tx
        .run
        .cursors
        .iter()
        .filter_map(|c| match c.status {
            CursorStatus::AwaitingApproval { task_id } => Some(task_id),
            _ => None,
        })
        .collect();
    let gate = tasks.iter().find(|task| {
        task.run_id == tx.run.id
            && task.is_pending()
            && task.origin == ApprovalOrigin::StateGate
            && awaited.contains(&task.id)
    });

    let (state_id, from_role, source_task, target_task) = match gate {
        Some(gate) => {
            let mut reassigned = gate.clone();
            reassigned.role = policy.escalation_role.clone();
            tx.push(StoreOp::UpdateApproval(reassigned));
            (gate.state_id.clone(), gate.role.clone(), Some(gate.id), gate.id)
        }
        None => {
            let state_id = tx.run.current_state().unwrap_or_default().to_string();
            let mut review = ApprovalTask::new(
                tx.run.id,
                &state_id,
                &policy.escalation_role,
                ApprovalOrigin::SlaEscalation,
                tx.now,
            );
            review.description = Some(format!("run {} passed its deadline", tx.run.id));
            let review_id = review.id;
            tx.push(StoreOp::CreateApproval(review));
            (state_id, SYSTEM_ROLE.to_string(), None, review_id)
        }
    };

    let escalation = Escalation {
        id: Uuid::new_v4(),
        run_id: tx.run.id,
        state_id: state_id.clone(),
        from_role: from_role.clone(),
        to_role: policy.escalation_role.clone(),
        reason: EscalationReason::SlaBreach,
        status: EscalationStatus::Open,
        source_task,
        target_task: Some(target_task),
        created_at: tx.now,
    };
    tx.audit(
        Some(&state_id),
        AuditAction::Escalated,
        ACTOR_SLA_MONITOR,
        json!({
            "escalation_id": escalation.id,
            "reason": EscalationReason::SlaBreach,
            "from_role": from_role,
            "to_role": policy.escalation_role,
            "task_id": target_task,
        }),
    );
    tx.push(StoreOp::CreateEscalation(escalation));
}
