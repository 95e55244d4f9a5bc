//! Integration test for the HTTP decision and event API

mod common;

use common::harness;
use flowgate_core::server::api::create_api_routes;
use flowgate_core::workflow::ResourceRegistry;
use serde_json::{json, Value};
use warp::http::StatusCode;

const DEFINITION: &str = r#"{
    "StartAt": "AwaitStock",
    "States": {
        "AwaitStock": {"Type": "Task", "Resource": "event:stock.arrived", "ResultPath": "$.stock", "Next": "Release"},
        "Release": {"Type": "Pass", "Approval": {"Role": "warehouse"}, "End": true}
    }
}"#;

fn body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_health_reports_pending_approvals() {
    let h = harness(ResourceRegistry::new());
    let routes = create_api_routes(h.orchestrator.clone());

    let response = warp::test::request()
        .method("GET")
        .path("/api/v1/health")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let health = body(response.body());
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["pending_approvals"], 0);
}

#[tokio::test]
async fn test_event_then_decision_completes_the_run() {
    let h = harness(ResourceRegistry::new());
    h.orchestrator.publish("restock", DEFINITION).await.unwrap();
    let run = h.orchestrator.start_run("restock", json!({}), "tester").await.unwrap();
    let routes = create_api_routes(h.orchestrator.clone());

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/api/v1/runs/{}/events", run.id))
        .json(&json!({"event_type": "stock.arrived", "payload": {"units": 40}}))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response.body())["matched"], 1);

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/api/v1/approvals?run_id={}", run.id))
        .reply(&routes)
        .await;
    let pending = body(response.body());
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(pending[0]["state_id"], "Release");

    let decision = json!({"state_id": "Release", "decision": "approved", "actor": "wei"});
    let response = warp::test::request()
        .method("POST")
        .path(&format!("/api/v1/runs/{}/decisions", run.id))
        .json(&decision)
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let resolution = body(response.body());
    assert_eq!(resolution["outcome"], "resumed");
    assert_eq!(resolution["decision"], "approved");

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/api/v1/runs/{}", run.id))
        .reply(&routes)
        .await;
    let run_body = body(response.body());
    assert_eq!(run_body["status"], "completed");
    assert_eq!(run_body["data"]["stock"]["units"], 40);

    // the same decision again is a conflict
    let response = warp::test::request()
        .method("POST")
        .path(&format!("/api/v1/runs/{}/decisions", run.id))
        .json(&decision)
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/api/v1/runs/{}/audit", run.id))
        .reply(&routes)
        .await;
    let audit = body(response.body());
    assert_eq!(audit[0]["action"], "run_created");
    assert_eq!(audit.as_array().unwrap().last().unwrap()["action"], "run_completed");
}

#[tokio::test]
async fn test_bad_requests_are_rejected() {
    let h = harness(ResourceRegistry::new());
    h.orchestrator.publish("restock", DEFINITION).await.unwrap();
    let run = h.orchestrator.start_run("restock", json!({}), "tester").await.unwrap();
    let routes = create_api_routes(h.orchestrator.clone());

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/api/v1/runs/{}/decisions", run.id))
        .json(&json!({"state_id": "Release", "decision": "maybe", "actor": "wei"}))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/api/v1/runs/{}/decisions", run.id))
        .json(&json!({"state_id": "Release", "decision": "approved", "actor": " "}))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = warp::test::request()
        .method("GET")
        .path("/api/v1/runs/6f1c7a52-0a53-4c1e-9d43-3c2a5e0f9b11")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // gate not reached yet: no task at that state
    let response = warp::test::request()
        .method("POST")
        .path(&format!("/api/v1/runs/{}/decisions", run.id))
        .json(&json!({"state_id": "Release", "decision": "approved", "actor": "wei"}))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tick_endpoint_returns_report() {
    let h = harness(ResourceRegistry::new());
    h.orchestrator.publish("restock", DEFINITION).await.unwrap();
    h.orchestrator.start_run("restock", json!({}), "tester").await.unwrap();
    let routes = create_api_routes(h.orchestrator.clone());

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/tick")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response.body())["runs_examined"], 1);
}
