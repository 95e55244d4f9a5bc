//! Human decisions on approval tasks and the rejection policies

use crate::models::definition::RejectionPolicy;
use crate::models::workflow::{
    ApprovalOrigin, ApprovalStatus, ApprovalTask, AuditAction, CursorStatus, Decision,
    Escalation, EscalationReason, EscalationStatus,
};
use crate::workflow::audit::ACTOR_ENGINE;
use crate::workflow::error::{
    ResourceError, WorkflowError, WorkflowResult, ERROR_SLA_ESCALATION_REJECTED,
};
use crate::workflow::interpreter::{Interpreter, Transaction};
use crate::workflow::store::StoreOp;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

/// What a decision did to the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Approved: the gated state's action runs
    Resumed,
    /// Rejected under `continue`: the action was skipped
    Skipped,
    /// Rejected under `alternate_path`
    Redirected { target: String },
    /// Rejected under `escalate`: a new task awaits the escalation role
    Escalated { task_id: Uuid, role: String },
    /// Rejected under `terminate`, or a rejected escalation
    Terminated,
    /// SLA review approved; the run is unaffected
    Acknowledged,
}

/// Result of `resolve`, returned to API callers
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    /// Task the decision was recorded on
    pub task_id: Uuid,
    /// Decision recorded
    pub decision: Decision,
    /// Effect on the run
    #[serde(flatten)]
    pub outcome: ResolutionOutcome,
}

/// Pick the task a decision on (run, state) applies to.
///
/// A pending gate task wins over a pending SLA review; decided tasks alone
/// mean the decision came too late.
pub fn find_pending<'t>(
    tasks: &'t [ApprovalTask],
    run_id: Uuid,
    state_id: &str,
) -> WorkflowResult<&'t ApprovalTask> {
    let mut matching = tasks
        .iter()
        .filter(|task| task.run_id == run_id && task.state_id == state_id)
        .peekable();
    if matching.peek().is_none() {
        return Err(WorkflowError::NotFound(format!(
            "approval task for state '{}' of run {}",
            state_id, run_id
        )));
    }
    let pending: Vec<&ApprovalTask> = matching.filter(|task| task.is_pending()).collect();
    let gate = pending
        .iter()
        .find(|task| task.origin == ApprovalOrigin::StateGate)
        .or_else(|| pending.first());
    match gate {
        Some(task) => Ok(*task),
        None => Err(WorkflowError::Conflict(format!(
            "approval at state '{}' of run {} is already decided",
            state_id, run_id
        ))),
    }
}

/// Record `decision` on `task` and apply its effect to the run in `tx`.
///
/// Everything lands in the transaction; the caller commits it as one batch.
pub fn apply_decision(
    interpreter: &Interpreter<'_>,
    tx: &mut Transaction,
    task: &ApprovalTask,
    escalations: &[Escalation],
    decision: Decision,
    actor: &str,
    comment: Option<String>,
) -> WorkflowResult<ResolutionOutcome> {
    if tx.run.is_terminal() {
        return Err(WorkflowError::InvalidState(format!(
            "run {} is already {:?}",
            tx.run.id, tx.run.status
        )));
    }

    let (status, action) = match decision {
        Decision::Approved => (ApprovalStatus::Approved, AuditAction::ApprovalApproved),
        Decision::Rejected => (ApprovalStatus::Rejected, AuditAction::ApprovalRejected),
    };
    tx.push(StoreOp::ResolveApproval {
        task_id: task.id,
        status,
        actor: actor.to_string(),
        comment: comment.clone(),
        at: tx.now,
    });
    tx.audit(
        Some(&task.state_id),
        action,
        actor,
        json!({ "task_id": task.id, "role": task.role, "comment": comment }),
    );

    for escalation in escalations
        .iter()
        .filter(|e| e.status == EscalationStatus::Open && e.target_task == Some(task.id))
    {
        let mut resolved = escalation.clone();
        resolved.status = EscalationStatus::Resolved;
        tx.push(StoreOp::UpdateEscalation(resolved));
    }

    match task.origin {
        ApprovalOrigin::SlaEscalation => Ok(match decision {
            Decision::Approved => ResolutionOutcome::Acknowledged,
            Decision::Rejected => {
                interpreter.fail_run(
                    tx,
                    &ResourceError::new(
                        ERROR_SLA_ESCALATION_REJECTED,
                        format!("SLA review rejected by {}", actor),
                    ),
                    Some(&task.state_id),
                );
                ResolutionOutcome::Terminated
            }
        }),
        ApprovalOrigin::StateGate => apply_gate_decision(interpreter, tx, task, decision, actor),
    }
}

fn apply_gate_decision(
    interpreter: &Interpreter<'_>,
    tx: &mut Transaction,
    task: &ApprovalTask,
    decision: Decision,
    actor: &str,
) -> WorkflowResult<ResolutionOutcome> {
    let cursor_id = task
        .cursor_id
        .ok_or_else(|| WorkflowError::InvalidState(format!("approval task {} has no cursor", task.id)))?;
    let cursor = tx
        .run
        .cursor(cursor_id)
        .filter(|c| c.status == CursorStatus::AwaitingApproval { task_id: task.id })
        .ok_or_else(|| {
            WorkflowError::InvalidState(format!(
                "run {} is not waiting on approval task {}",
                tx.run.id, task.id
            ))
        })?;
    let state = interpreter
        .definition()
        .state_at(&cursor.graph, &cursor.state)
        .ok_or_else(|| WorkflowError::InvalidState(format!("state '{}' no longer exists", cursor.state)))?;
    let approval = state
        .approval
        .as_ref()
        .ok_or_else(|| WorkflowError::InvalidState(format!("state '{}' has no approval gate", state.name)))?;

    if decision == Decision::Approved {
        interpreter.grant_approval(tx, cursor_id);
        return Ok(ResolutionOutcome::Resumed);
    }

    let policy = if task.escalated_from.is_some() {
        RejectionPolicy::Terminate
    } else {
        approval.on_rejection
    };
    tracing::info!(
        run_id = %tx.run.id,
        state = %state.name,
        policy = policy.as_str(),
        "applying rejection policy"
    );

    match policy {
        RejectionPolicy::Terminate => {
            interpreter.terminate_rejected(tx, &state.name, actor);
            Ok(ResolutionOutcome::Terminated)
        }
        RejectionPolicy::Continue => {
            interpreter.skip_state(tx, cursor_id);
            Ok(ResolutionOutcome::Skipped)
        }
        RejectionPolicy::AlternatePath => {
            let target = approval.alternate_state.clone().ok_or_else(|| {
                WorkflowError::InvalidState(format!("state '{}' has no AlternateState", state.name))
            })?;
            interpreter.redirect(tx, cursor_id, &target);
            Ok(ResolutionOutcome::Redirected { target })
        }
        RejectionPolicy::Escalate => {
            let role = approval.escalation_role.clone().ok_or_else(|| {
                WorkflowError::InvalidState(format!("state '{}' has no EscalationRole", state.name))
            })?;
            let task_id = escalate(tx, task, &role, EscalationReason::Rejection, ACTOR_ENGINE);
            Ok(ResolutionOutcome::Escalated { task_id, role })
        }
    }
}

/// Hand a rejected gate decision to `role`: new task, escalation record, cursor re-parked
fn escalate(
    tx: &mut Transaction,
    source: &ApprovalTask,
    role: &str,
    reason: EscalationReason,
    actor: &str,
) -> Uuid {
    let mut task = ApprovalTask::new(tx.run.id, &source.state_id, role, source.origin, tx.now);
    task.cursor_id = source.cursor_id;
    task.description = source.description.clone();
    task.escalated_from = Some(source.id);
    let task_id = task.id;

    let escalation = Escalation {
        id: Uuid::new_v4(),
        run_id: tx.run.id,
        state_id: source.state_id.clone(),
        from_role: source.role.clone(),
        to_role: role.to_string(),
        reason,
        status: EscalationStatus::Open,
        source_task: Some(source.id),
        target_task: Some(task_id),
        created_at: tx.now,
    };

    if let Some(cursor) = source.cursor_id.and_then(|id| tx.run.cursor_mut(id)) {
        cursor.status = CursorStatus::AwaitingApproval { task_id };
    }
    tx.audit(
        Some(&source.state_id),
        AuditAction::Escalated,
        actor,
        json!({
            "escalation_id": escalation.id,
            "reason": reason,
            "from_role": source.role,
            "to_role": role,
            "task_id": task_id,
        }),
    );
    tx.push(StoreOp::CreateApproval(task));
    tx.push(StoreOp::CreateEscalation(escalation));
    task_id
}
