//! Integration test for Wait states: timestamps, data-driven delays and their error paths

mod common;

use common::{count, harness};
use flowgate_core::models::{AuditAction, RunStatus};
use flowgate_core::workflow::{ResourceRegistry, WorkflowError};
use serde_json::{json, Value};

/// Wait driven by `field`, routing `States.Runtime` to `Fallback`
fn guarded_wait(field: &str, path: &str) -> String {
    format!(
        r#"{{
            "StartAt": "Hold",
            "States": {{
                "Hold": {{
                    "Type": "Wait",
                    "{}": "{}",
                    "Catch": [{{"ErrorEquals": ["States.Runtime"], "Next": "Fallback", "ResultPath": "$.error"}}],
                    "Next": "Release"
                }},
                "Release": {{"Type": "Pass", "Result": "released", "ResultPath": "$.outcome", "End": true}},
                "Fallback": {{"Type": "Pass", "Result": "fallback", "ResultPath": "$.outcome", "End": true}}
            }}
        }}"#,
        field, path
    )
}

#[tokio::test]
async fn test_fixed_timestamp_wait_resumes_at_that_instant() {
    let definition = r#"{
        "StartAt": "Hold",
        "States": {
            "Hold": {"Type": "Wait", "Timestamp": "2026-03-02T09:10:00Z", "Next": "Release"},
            "Release": {"Type": "Pass", "Result": "released", "ResultPath": "$.outcome", "End": true}
        }
    }"#;
    let h = harness(ResourceRegistry::new());
    h.orchestrator.publish("embargo", definition).await.unwrap();
    let run = h.orchestrator.start_run("embargo", json!({}), "tester").await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.current_state(), Some("Hold"));

    h.clock.advance_seconds(599);
    h.orchestrator.tick().await.unwrap();
    assert_eq!(h.orchestrator.get_run(run.id).await.unwrap().status, RunStatus::Running);

    h.clock.advance_seconds(1);
    let report = h.orchestrator.tick().await.unwrap();
    assert_eq!(report.runs_completed, 1);
    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.data["outcome"], "released");

    let audit = h.orchestrator.audit(run.id).await.unwrap();
    assert_eq!(count(&audit, AuditAction::WaitScheduled), 1);
    assert_eq!(count(&audit, AuditAction::WaitElapsed), 1);
}

#[tokio::test]
async fn test_timestamp_path_reads_the_instant_from_run_data() {
    let h = harness(ResourceRegistry::new());
    h.orchestrator
        .publish("embargo", &guarded_wait("TimestampPath", "$.release_at"))
        .await
        .unwrap();
    let run = h
        .orchestrator
        .start_run("embargo", json!({"release_at": "2026-03-02T10:05:00+01:00"}), "tester")
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);

    // 10:05+01:00 is five minutes after the 09:00Z start
    h.clock.advance_seconds(299);
    assert_eq!(h.orchestrator.tick().await.unwrap().runs_completed, 0);
    h.clock.advance_seconds(1);
    let report = h.orchestrator.tick().await.unwrap();
    assert_eq!(report.runs_completed, 1);
    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.data["outcome"], "released");
    assert!(run.data.get("error").is_none());
}

#[tokio::test]
async fn test_seconds_path_waits_for_the_selected_delay() {
    let h = harness(ResourceRegistry::new());
    h.orchestrator
        .publish("cooldown", &guarded_wait("SecondsPath", "$.delay"))
        .await
        .unwrap();
    let run = h
        .orchestrator
        .start_run("cooldown", json!({"delay": 30}), "tester")
        .await
        .unwrap();

    h.clock.advance_seconds(29);
    h.orchestrator.tick().await.unwrap();
    assert_eq!(h.orchestrator.get_run(run.id).await.unwrap().status, RunStatus::Running);

    h.clock.advance_seconds(1);
    h.orchestrator.tick().await.unwrap();
    let run = h.orchestrator.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.data["outcome"], "released");
}

async fn start_with(field: &str, input: Value) -> Value {
    let h = harness(ResourceRegistry::new());
    let path = if field == "SecondsPath" { "$.delay" } else { "$.release_at" };
    h.orchestrator.publish("guarded", &guarded_wait(field, path)).await.unwrap();
    let run = h.orchestrator.start_run("guarded", input, "tester").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed, "{:?}", run.failure);
    assert_eq!(run.data["outcome"], "fallback");
    run.data
}

#[tokio::test]
async fn test_bad_wait_inputs_raise_runtime_errors_into_catch() {
    let cases = [
        ("SecondsPath", json!({"delay": -5})),
        ("SecondsPath", json!({"delay": "soon"})),
        ("SecondsPath", json!({})),
        ("SecondsPath", json!({"delay": 1e18})),
        ("SecondsPath", json!({"delay": 1e14})),
        ("TimestampPath", json!({"release_at": "next tuesday"})),
        ("TimestampPath", json!({"release_at": 1767225600})),
    ];
    for (field, input) in cases {
        let data = start_with(field, input.clone()).await;
        assert_eq!(data["error"]["Error"], "States.Runtime", "{} {}", field, input);
        assert!(data["error"]["Cause"].as_str().is_some(), "{} {}", field, input);
    }
}

#[tokio::test]
async fn test_timestamp_already_past_releases_immediately() {
    let h = harness(ResourceRegistry::new());
    h.orchestrator
        .publish("embargo", &guarded_wait("TimestampPath", "$.release_at"))
        .await
        .unwrap();
    let run = h
        .orchestrator
        .start_run("embargo", json!({"release_at": "2020-01-01T00:00:00Z"}), "tester")
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.data["outcome"], "released");
}

#[tokio::test]
async fn test_out_of_range_wait_without_catch_fails_the_run() {
    let definition = r#"{
        "StartAt": "Hold",
        "States": {"Hold": {"Type": "Wait", "SecondsPath": "$.delay", "End": true}}
    }"#;
    let h = harness(ResourceRegistry::new());
    h.orchestrator.publish("cooldown", definition).await.unwrap();
    let run = h
        .orchestrator
        .start_run("cooldown", json!({"delay": 1e18}), "tester")
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.unwrap();
    assert_eq!(failure.error, "States.Runtime");
    assert_eq!(failure.state.as_deref(), Some("Hold"));

    // the run lock was released: later calls still work
    assert_eq!(h.orchestrator.tick().await.unwrap().runs_examined, 0);
}

#[tokio::test]
async fn test_oversized_fixed_wait_is_rejected_at_publish() {
    let definition = r#"{
        "StartAt": "Hold",
        "States": {"Hold": {"Type": "Wait", "Seconds": 100000000000000, "End": true}}
    }"#;
    let h = harness(ResourceRegistry::new());
    let result = h.orchestrator.publish("cooldown", definition).await;
    let Err(WorkflowError::Validation(error)) = result else {
        panic!("expected a validation error");
    };
    assert!(error.has_issue_at("States.Hold.Seconds"), "{}", error);
}
