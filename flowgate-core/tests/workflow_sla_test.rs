//! Integration test for SLA classification and overdue escalation

mod common;

use chrono::Duration;
use common::{count, harness_with_config, start_time};
use flowgate_core::models::{
    ApprovalOrigin, AuditAction, Configuration, Decision, EscalationReason, EscalationStatus,
    RunStatus, SlaStatus,
};
use flowgate_core::workflow::{handler_fn, ResolutionOutcome, ResourceError, ResourceRegistry};
use serde_json::json;

const WAITING: &str = r#"{
    "StartAt": "Hold",
    "States": {
        "Hold": {"Type": "Wait", "Seconds": 1000, "Next": "Done"},
        "Done": {"Type": "Succeed"}
    }
}"#;

const GATED: &str = r#"{
    "StartAt": "Signoff",
    "States": {
        "Signoff": {"Type": "Pass", "Approval": {"Role": "manager"}, "End": true}
    }
}"#;

fn sla_config() -> Configuration {
    let mut config = Configuration::default();
    config.sla.at_risk_window_seconds = 30;
    config.sla.escalation_role = "ops-lead".to_string();
    config
}

fn rank(status: SlaStatus) -> u8 {
    match status {
        SlaStatus::OnTime => 0,
        SlaStatus::AtRisk => 1,
        SlaStatus::Overdue => 2,
        SlaStatus::Escalated => 3,
        SlaStatus::Completed => 4,
    }
}

#[tokio::test]
async fn test_sla_status_only_moves_forward_and_escalates_once() {
    let h = harness_with_config(ResourceRegistry::new(), sla_config());
    h.orchestrator.publish("hold", WAITING).await.unwrap();
    let run = h
        .orchestrator
        .start_run_with_deadline("hold", json!({}), "tester", start_time() + Duration::seconds(100))
        .await
        .unwrap();

    let mut observed = vec![run.sla_status];
    for offset in [10, 75, 80, 101, 150, 400] {
        h.clock.set(start_time() + Duration::seconds(offset));
        h.orchestrator.tick().await.unwrap();
        observed.push(h.orchestrator.get_run(run.id).await.unwrap().sla_status);
    }

    assert_eq!(
        observed,
        vec![
            SlaStatus::OnTime,
            SlaStatus::OnTime,
            SlaStatus::AtRisk,
            SlaStatus::AtRisk,
            SlaStatus::Escalated,
            SlaStatus::Escalated,
            SlaStatus::Escalated,
        ]
    );
    assert!(observed.windows(2).all(|pair| rank(pair[0]) <= rank(pair[1])));

    let escalations = h.orchestrator.escalations(Some(run.id)).await.unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].reason, EscalationReason::SlaBreach);
    assert_eq!(escalations[0].to_role, "ops-lead");

    // no gate was pending, so the monitor opened a review task
    let pending = h.orchestrator.pending_approvals(Some(run.id)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].origin, ApprovalOrigin::SlaEscalation);
    assert_eq!(pending[0].role, "ops-lead");
    assert_eq!(pending[0].state_id, "Hold");

    let audit = h.orchestrator.audit(run.id).await.unwrap();
    assert_eq!(count(&audit, AuditAction::Escalated), 1);
    let transitions: Vec<(String, String)> = audit
        .iter()
        .filter(|e| e.action == AuditAction::SlaStatusChanged)
        .map(|e| {
            (
                e.detail["from"].as_str().unwrap().to_string(),
                e.detail["to"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            ("on_time".to_string(), "at_risk".to_string()),
            ("at_risk".to_string(), "overdue".to_string()),
            ("overdue".to_string(), "escalated".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_run_jumping_past_deadline_goes_straight_to_escalated() {
    let h = harness_with_config(ResourceRegistry::new(), sla_config());
    h.orchestrator.publish("hold", WAITING).await.unwrap();
    let run = h
        .orchestrator
        .start_run_with_deadline("hold", json!({}), "tester", start_time() + Duration::seconds(100))
        .await
        .unwrap();

    h.clock.set(start_time() + Duration::seconds(500));
    let report = h.orchestrator.tick().await.unwrap();
    assert_eq!(report.escalations_raised, 1);
    assert_eq!(report.sla_transitions, 2);

    let report = h.orchestrator.tick().await.unwrap();
    assert_eq!(report.escalations_raised, 0);
    assert_eq!(report.sla_transitions, 0);
    assert_eq!(
        h.orchestrator.get_run(run.id).await.unwrap().sla_status,
        SlaStatus::Escalated
    );
}

#[tokio::test]
async fn test_overdue_gate_is_reassigned_to_the_escalation_role() {
    let h = harness_with_config(ResourceRegistry::new(), sla_config());
    h.orchestrator.publish("signoff", GATED).await.unwrap();
    let run = h
        .orchestrator
        .start_run_with_deadline("signoff", json!({}), "tester", start_time() + Duration::seconds(60))
        .await
        .unwrap();
    let gate = h.orchestrator.pending_approvals(Some(run.id)).await.unwrap()[0].clone();

    h.clock.set(start_time() + Duration::seconds(61));
    h.orchestrator.tick().await.unwrap();

    let pending = h.orchestrator.pending_approvals(Some(run.id)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, gate.id);
    assert_eq!(pending[0].role, "ops-lead");

    let escalations = h.orchestrator.escalations(Some(run.id)).await.unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].from_role, "manager");
    assert_eq!(escalations[0].source_task, Some(gate.id));

    let resolution = h
        .orchestrator
        .resolve(run.id, "Signoff", Decision::Approved, "olga", None)
        .await
        .unwrap();
    assert_eq!(resolution.outcome, ResolutionOutcome::Resumed);

    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.sla_status, SlaStatus::Completed);
}

#[tokio::test]
async fn test_completion_marks_sla_completed_from_at_risk() {
    let h = harness_with_config(ResourceRegistry::new(), sla_config());
    h.orchestrator.publish("signoff", GATED).await.unwrap();
    let run = h
        .orchestrator
        .start_run_with_deadline("signoff", json!({}), "tester", start_time() + Duration::seconds(60))
        .await
        .unwrap();

    h.clock.set(start_time() + Duration::seconds(45));
    h.orchestrator.tick().await.unwrap();
    assert_eq!(
        h.orchestrator.get_run(run.id).await.unwrap().sla_status,
        SlaStatus::AtRisk
    );

    h.orchestrator
        .resolve(run.id, "Signoff", Decision::Approved, "maria", None)
        .await
        .unwrap();
    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.sla_status, SlaStatus::Completed);

    // terminal runs are no longer examined
    h.clock.set(start_time() + Duration::seconds(600));
    let report = h.orchestrator.tick().await.unwrap();
    assert_eq!(report.runs_examined, 0);
    assert!(h.orchestrator.escalations(Some(run.id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_sla_review_fails_the_run() {
    let h = harness_with_config(ResourceRegistry::new(), sla_config());
    h.orchestrator.publish("hold", WAITING).await.unwrap();
    let run = h
        .orchestrator
        .start_run_with_deadline("hold", json!({}), "tester", start_time() + Duration::seconds(10))
        .await
        .unwrap();

    h.clock.set(start_time() + Duration::seconds(20));
    h.orchestrator.tick().await.unwrap();

    let resolution = h
        .orchestrator
        .resolve(run.id, "Hold", Decision::Rejected, "olga", None)
        .await
        .unwrap();
    assert_eq!(resolution.outcome, ResolutionOutcome::Terminated);

    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure.unwrap().error, "SlaEscalationRejected");
}

/// Gated Task that backs off once, then routes its failure back into itself
const GATED_LOOP: &str = r#"{
    "StartAt": "Charge",
    "States": {
        "Charge": {
            "Type": "Task",
            "Resource": "payments:charge",
            "Approval": {"Role": "manager"},
            "Retry": [{"ErrorEquals": ["States.TaskFailed"], "IntervalSeconds": 100, "MaxAttempts": 1}],
            "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Charge", "ResultPath": "$.failure"}],
            "End": true
        }
    }
}"#;

fn failing_charge() -> ResourceRegistry {
    let registry = ResourceRegistry::new();
    registry.register(
        "payments:charge",
        handler_fn(|_input| async { Err(ResourceError::task_failed("gateway unavailable")) }),
    );
    registry
}

#[tokio::test]
async fn test_gate_reentered_after_sla_review_takes_the_review_over() {
    let h = harness_with_config(failing_charge(), sla_config());
    h.orchestrator.publish("charge", GATED_LOOP).await.unwrap();
    let run = h
        .orchestrator
        .start_run_with_deadline("charge", json!({}), "tester", start_time() + Duration::seconds(5))
        .await
        .unwrap();
    h.orchestrator
        .resolve(run.id, "Charge", Decision::Approved, "maria", None)
        .await
        .unwrap();

    // overdue while backing off: no gate is awaited, so a review is opened
    h.clock.set(start_time() + Duration::seconds(6));
    h.orchestrator.tick().await.unwrap();
    let pending = h.orchestrator.pending_approvals(Some(run.id)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].origin, ApprovalOrigin::SlaEscalation);
    let review = pending[0].clone();

    // the retry fails, the catch re-enters the gated state
    h.clock.set(start_time() + Duration::seconds(206));
    h.orchestrator.tick().await.unwrap();

    let pending = h.orchestrator.pending_approvals(Some(run.id)).await.unwrap();
    assert_eq!(pending.len(), 1, "{:?}", pending);
    let gate = pending[0].clone();
    assert_eq!(gate.origin, ApprovalOrigin::StateGate);
    assert_eq!(gate.state_id, "Charge");
    assert_eq!(gate.role, "ops-lead");

    let escalations = h.orchestrator.escalations(Some(run.id)).await.unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].source_task, None);
    assert_eq!(escalations[0].target_task, Some(gate.id));

    let audit = h.orchestrator.audit(run.id).await.unwrap();
    let requested = audit
        .iter()
        .rev()
        .find(|entry| entry.action == AuditAction::ApprovalRequested)
        .unwrap();
    assert_eq!(requested.detail["superseded"], json!(review.id));

    // deciding the gate closes the escalation raised for the review
    h.orchestrator
        .resolve(run.id, "Charge", Decision::Approved, "olga", None)
        .await
        .unwrap();
    let escalations = h.orchestrator.escalations(Some(run.id)).await.unwrap();
    assert_eq!(escalations[0].status, EscalationStatus::Resolved);
    assert!(h.orchestrator.pending_approvals(Some(run.id)).await.unwrap().is_empty());
}
