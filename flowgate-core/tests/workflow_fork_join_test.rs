//! Integration test for Parallel join barriers and Map concurrency bounds

mod common;

use common::{count, harness};
use flowgate_core::models::{AuditAction, Decision, RunStatus};
use flowgate_core::workflow::{handler_fn, ResourceError, ResourceRegistry};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_parallel_resumes_only_after_the_slowest_branch() {
    let definition = r#"{
        "StartAt": "Checks",
        "States": {
            "Checks": {
                "Type": "Parallel",
                "Branches": [
                    {"StartAt": "SlowCheck", "States": {
                        "SlowCheck": {"Type": "Wait", "Seconds": 5, "Next": "SlowDone"},
                        "SlowDone": {"Type": "Pass", "Result": "credit-ok", "End": true}
                    }},
                    {"StartAt": "FastCheck", "States": {
                        "FastCheck": {"Type": "Wait", "Seconds": 1, "Next": "FastDone"},
                        "FastDone": {"Type": "Pass", "Result": "fraud-ok", "End": true}
                    }}
                ],
                "ResultPath": "$.checks",
                "Next": "Decide"
            },
            "Decide": {"Type": "Pass", "Result": "approved", "ResultPath": "$.decision", "End": true}
        }
    }"#;
    let h = harness(ResourceRegistry::new());
    h.orchestrator.publish("loan", definition).await.unwrap();

    let run = h.orchestrator.start_run("loan", json!({"applicant": "kim"}), "tester").await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.cursors.len(), 3);

    h.clock.advance_seconds(1);
    h.orchestrator.tick().await.unwrap();
    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.cursors.len(), 2);
    assert_eq!(run.current_state(), Some("Checks"));
    let audit = h.orchestrator.audit(run.id).await.unwrap();
    assert_eq!(count(&audit, AuditAction::JoinReleased), 0);

    h.clock.advance_seconds(4);
    let report = h.orchestrator.tick().await.unwrap();
    assert_eq!(report.runs_completed, 1);

    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.data["checks"], json!(["credit-ok", "fraud-ok"]));
    assert_eq!(run.data["decision"], "approved");
    assert_eq!(run.data["applicant"], "kim");

    let audit = h.orchestrator.audit(run.id).await.unwrap();
    assert_eq!(count(&audit, AuditAction::JoinReleased), 1);
    let decided = audit
        .iter()
        .filter(|e| e.action == AuditAction::StepSucceeded && e.state_id.as_deref() == Some("Decide"))
        .count();
    assert_eq!(decided, 1);
}

#[tokio::test]
async fn test_racing_branch_completions_release_the_join_once() {
    let definition = r#"{
        "StartAt": "Lookups",
        "States": {
            "Lookups": {
                "Type": "Parallel",
                "Branches": [
                    {"StartAt": "A", "States": {"A": {"Type": "Task", "Resource": "lookup:slow", "End": true}}},
                    {"StartAt": "B", "States": {"B": {"Type": "Task", "Resource": "lookup:fast", "End": true}}},
                    {"StartAt": "C", "States": {"C": {"Type": "Task", "Resource": "lookup:fast", "End": true}}}
                ],
                "Next": "Merge"
            },
            "Merge": {"Type": "Task", "Resource": "lookup:merge", "End": true}
        }
    }"#;
    let merges = Arc::new(AtomicUsize::new(0));
    let registry = ResourceRegistry::new();
    registry.register(
        "lookup:slow",
        handler_fn(|_input| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(json!("slow"))
        }),
    );
    registry.register(
        "lookup:fast",
        handler_fn(|_input| async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(json!("fast"))
        }),
    );
    let merge_calls = merges.clone();
    registry.register(
        "lookup:merge",
        handler_fn(move |input| {
            let merge_calls = merge_calls.clone();
            async move {
                merge_calls.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        }),
    );
    let h = harness(registry);
    h.orchestrator.publish("lookups", definition).await.unwrap();

    let run = h.orchestrator.start_run("lookups", json!({}), "tester").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.data, json!(["slow", "fast", "fast"]));
    assert_eq!(merges.load(Ordering::SeqCst), 1);

    let audit = h.orchestrator.audit(run.id).await.unwrap();
    assert_eq!(count(&audit, AuditAction::BranchesForked), 1);
    assert_eq!(count(&audit, AuditAction::JoinReleased), 1);
}

/// Iterator handler that records how many calls are in flight at once
fn instrumented_hold(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> ResourceRegistry {
    let registry = ResourceRegistry::new();
    registry.register(
        "inventory:hold",
        handler_fn(move |input: Value| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now_active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                let sku = input["item"]["sku"].clone();
                if sku.is_null() {
                    return Err(ResourceError::task_failed("line without sku"));
                }
                Ok(json!({"sku": sku, "slot": input["index"]}))
            }
        }),
    );
    registry
}

fn reserve_definition(max_concurrency: u32) -> String {
    format!(
        r#"{{
            "StartAt": "Reserve",
            "States": {{
                "Reserve": {{
                    "Type": "Map",
                    "ItemsPath": "$.lines",
                    "MaxConcurrency": {},
                    "Iterator": {{
                        "StartAt": "Hold",
                        "States": {{"Hold": {{"Type": "Task", "Resource": "inventory:hold", "End": true}}}}
                    }},
                    "ResultPath": "$.holds",
                    "End": true
                }}
            }}
        }}"#,
        max_concurrency
    )
}

fn order_lines() -> Value {
    json!({"lines": [
        {"sku": "A-1"}, {"sku": "B-2"}, {"sku": "C-3"}, {"sku": "D-4"}, {"sku": "E-5"}
    ]})
}

#[tokio::test]
async fn test_map_never_exceeds_max_concurrency() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let h = harness(instrumented_hold(active.clone(), peak.clone()));
    h.orchestrator.publish("reserve", &reserve_definition(2)).await.unwrap();

    let run = h.orchestrator.start_run("reserve", order_lines(), "tester").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
    assert_eq!(active.load(Ordering::SeqCst), 0);

    let holds = run.data["holds"].as_array().unwrap();
    assert_eq!(holds.len(), 5);
    for (index, hold) in holds.iter().enumerate() {
        assert_eq!(hold["slot"], index);
    }
    assert_eq!(holds[0]["sku"], "A-1");
    assert_eq!(holds[4]["sku"], "E-5");

    let audit = h.orchestrator.audit(run.id).await.unwrap();
    let released = audit
        .iter()
        .find(|e| e.action == AuditAction::JoinReleased)
        .unwrap();
    assert!(released.detail["peak_active"].as_u64().unwrap() <= 2);
    assert_eq!(released.detail["results"], 5);
}

#[tokio::test]
async fn test_map_without_bound_runs_every_item_together() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let h = harness(instrumented_hold(active, peak.clone()));
    h.orchestrator.publish("reserve", &reserve_definition(0)).await.unwrap();

    let run = h.orchestrator.start_run("reserve", order_lines(), "tester").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_failing_map_item_fails_the_whole_map() {
    let h = harness(instrumented_hold(
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
    ));
    h.orchestrator.publish("reserve", &reserve_definition(2)).await.unwrap();

    let run = h
        .orchestrator
        .start_run("reserve", json!({"lines": [{"sku": "A-1"}, {"qty": 3}, {"sku": "C-3"}]}), "tester")
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure.unwrap().error, "States.TaskFailed");
    assert!(run.cursors.is_empty());
}

#[tokio::test]
async fn test_approval_inside_map_is_keyed_per_item() {
    let definition = r#"{
        "StartAt": "Review",
        "States": {
            "Review": {
                "Type": "Map",
                "ItemsPath": "$.invoices",
                "Iterator": {
                    "StartAt": "Check",
                    "States": {"Check": {"Type": "Pass", "Approval": {"Role": "clerk"}, "End": true}}
                },
                "End": true
            }
        }
    }"#;
    let h = harness(ResourceRegistry::new());
    h.orchestrator.publish("invoices", definition).await.unwrap();

    let run = h
        .orchestrator
        .start_run("invoices", json!({"invoices": ["inv-1", "inv-2"]}), "tester")
        .await
        .unwrap();
    let mut keys: Vec<String> = h
        .orchestrator
        .pending_approvals(Some(run.id))
        .await
        .unwrap()
        .into_iter()
        .map(|task| task.state_id)
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["$/Review[*]#0/Check", "$/Review[*]#1/Check"]);

    h.orchestrator
        .resolve(run.id, "$/Review[*]#1/Check", Decision::Approved, "clerk-1", None)
        .await
        .unwrap();
    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);

    h.orchestrator
        .resolve(run.id, "$/Review[*]#0/Check", Decision::Approved, "clerk-1", None)
        .await
        .unwrap();
    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.data,
        json!([{"item": "inv-1", "index": 0}, {"item": "inv-2", "index": 1}])
    );
}
