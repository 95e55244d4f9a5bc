//! HTTP decision and event API

use crate::models::workflow::Decision;
use crate::workflow::error::WorkflowError;
use crate::workflow::orchestrator::WorkflowOrchestrator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::Filter;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    ValidationError(String),
}

impl warp::reject::Reject for ApiError {}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub pending_approvals: usize,
}

/// Body of POST /api/v1/runs/:id/decisions
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRequest {
    pub state_id: String,
    pub decision: String,
    pub actor: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Body of POST /api/v1/runs/:id/events
#[derive(Debug, Clone, Deserialize)]
pub struct EventRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Response of POST /api/v1/runs/:id/events
#[derive(Debug, Clone, Serialize)]
pub struct EventResponse {
    pub run_id: Uuid,
    pub event_type: String,
    pub matched: usize,
}

/// Query for GET /api/v1/approvals
#[derive(Debug, Deserialize)]
struct ApprovalsQuery {
    run_id: Option<Uuid>,
}

/// HTTP status for a workflow error
pub fn status_for(error: &WorkflowError) -> StatusCode {
    match error {
        WorkflowError::Validation(_) => StatusCode::BAD_REQUEST,
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::Conflict(_) | WorkflowError::InvalidState(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(error: &WorkflowError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = status_for(error);
    if status.is_server_error() {
        crate::services::logging::log_error(&error.to_string(), Some("api"));
    }
    let mut body = serde_json::json!({ "error": error.to_string() });
    if let WorkflowError::Validation(validation) = error {
        body["issues"] = serde_json::json!(validation.issues);
    }
    warp::reply::with_status(warp::reply::json(&body), status)
}

fn ok_reply<T: Serialize>(value: &T) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(value), StatusCode::OK)
}

/// Create HTTP API routes
pub fn create_api_routes(
    orchestrator: WorkflowOrchestrator,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let orchestrator_filter = warp::any().map(move || orchestrator.clone());

    // GET /api/v1/health - Health check endpoint
    let get_health = warp::path!("api" / "v1" / "health")
        .and(warp::get())
        .and(orchestrator_filter.clone())
        .and_then(handle_get_health);

    // GET /api/v1/runs/:id - Run snapshot
    let get_run = warp::path!("api" / "v1" / "runs" / Uuid)
        .and(warp::get())
        .and(orchestrator_filter.clone())
        .and_then(handle_get_run);

    // GET /api/v1/runs/:id/audit - Audit trail of a run
    let get_audit = warp::path!("api" / "v1" / "runs" / Uuid / "audit")
        .and(warp::get())
        .and(orchestrator_filter.clone())
        .and_then(handle_get_audit);

    // GET /api/v1/approvals - Pending approval tasks
    let get_approvals = warp::path!("api" / "v1" / "approvals")
        .and(warp::get())
        .and(warp::query::<ApprovalsQuery>())
        .and(orchestrator_filter.clone())
        .and_then(handle_get_approvals);

    // POST /api/v1/runs/:id/decisions - Resolve an approval
    let post_decision = warp::path!("api" / "v1" / "runs" / Uuid / "decisions")
        .and(warp::post())
        .and(warp::body::json())
        .and(orchestrator_filter.clone())
        .and_then(handle_post_decision);

    // POST /api/v1/runs/:id/events - Inject an event
    let post_event = warp::path!("api" / "v1" / "runs" / Uuid / "events")
        .and(warp::post())
        .and(warp::body::json())
        .and(orchestrator_filter.clone())
        .and_then(handle_post_event);

    // POST /api/v1/tick - Run one scheduler pass
    let post_tick = warp::path!("api" / "v1" / "tick")
        .and(warp::post())
        .and(orchestrator_filter.clone())
        .and_then(handle_post_tick);

    get_health
        .or(get_run)
        .or(get_audit)
        .or(get_approvals)
        .or(post_decision)
        .or(post_event)
        .or(post_tick)
        .recover(handle_rejection)
}

/// Handle GET /api/v1/health
async fn handle_get_health(
    orchestrator: WorkflowOrchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let pending_approvals = orchestrator
        .pending_approvals(None)
        .await
        .map(|tasks| tasks.len())
        .unwrap_or(0);

    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pending_approvals,
    };

    Ok(warp::reply::json(&response))
}

/// Handle GET /api/v1/runs/:id
async fn handle_get_run(
    run_id: Uuid,
    orchestrator: WorkflowOrchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(match orchestrator.get_run(run_id).await {
        Ok(run) => ok_reply(&run),
        Err(e) => error_reply(&e),
    })
}

/// Handle GET /api/v1/runs/:id/audit
async fn handle_get_audit(
    run_id: Uuid,
    orchestrator: WorkflowOrchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(match orchestrator.audit(run_id).await {
        Ok(entries) => ok_reply(&entries),
        Err(e) => error_reply(&e),
    })
}

/// Handle GET /api/v1/approvals
async fn handle_get_approvals(
    query: ApprovalsQuery,
    orchestrator: WorkflowOrchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(match orchestrator.pending_approvals(query.run_id).await {
        Ok(tasks) => ok_reply(&tasks),
        Err(e) => error_reply(&e),
    })
}

/// Handle POST /api/v1/runs/:id/decisions
async fn handle_post_decision(
    run_id: Uuid,
    request: DecisionRequest,
    orchestrator: WorkflowOrchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let decision = Decision::parse(&request.decision).ok_or_else(|| {
        warp::reject::custom(ApiError::ValidationError(format!(
            "decision must be 'approved' or 'rejected', got '{}'",
            request.decision
        )))
    })?;
    if request.actor.trim().is_empty() {
        return Err(warp::reject::custom(ApiError::ValidationError(
            "actor is required".to_string(),
        )));
    }

    crate::services::logging::log_decision(
        &run_id.to_string(),
        &request.state_id,
        &request.actor,
        &request.decision,
    );
    Ok(
        match orchestrator
            .resolve(run_id, &request.state_id, decision, &request.actor, request.comment)
            .await
        {
            Ok(resolution) => ok_reply(&resolution),
            Err(e) => error_reply(&e),
        },
    )
}

/// Handle POST /api/v1/runs/:id/events
async fn handle_post_event(
    run_id: Uuid,
    request: EventRequest,
    orchestrator: WorkflowOrchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(
        match orchestrator
            .notify(run_id, &request.event_type, request.payload)
            .await
        {
            Ok(matched) => ok_reply(&EventResponse {
                run_id,
                event_type: request.event_type,
                matched,
            }),
            Err(e) => error_reply(&e),
        },
    )
}

/// Handle POST /api/v1/tick
async fn handle_post_tick(
    orchestrator: WorkflowOrchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(match orchestrator.tick().await {
        Ok(report) => ok_reply(&report),
        Err(e) => error_reply(&e),
    })
}

/// Turn rejections into JSON error bodies
async fn handle_rejection(rejection: warp::Rejection) -> Result<impl warp::Reply, warp::Rejection> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(ApiError::ValidationError(message)) = rejection.find::<ApiError>() {
        (StatusCode::BAD_REQUEST, message.clone())
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("invalid body: {}", e))
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        return Err(rejection);
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    ))
}
