//! Workflow command handlers

use crate::cli::workflow::RenderFormat;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use flowgate_core::models::{Configuration, Decision, Run};
use flowgate_core::workflow::parser::to_document;
use flowgate_core::workflow::{
    load_definitions_from_dir, parse_definition, serialize_definition, JsonFileStore,
    ResourceRegistry, WorkflowOrchestrator, WorkflowValidator,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Settings shared by every workflow command
pub struct CliContext {
    /// Loaded configuration
    pub config: Configuration,
    /// Run store file
    pub store_path: PathBuf,
}

impl CliContext {
    pub fn new(config: Configuration, store_override: Option<PathBuf>) -> Self {
        let store_path = store_override.unwrap_or_else(|| config.resolved_store_path());
        Self { config, store_path }
    }

    /// Create workflow orchestrator instance
    pub fn orchestrator(&self) -> Result<WorkflowOrchestrator> {
        let store = JsonFileStore::open(&self.store_path)
            .context("Failed to initialize run store")?;
        Ok(WorkflowOrchestrator::new(
            Arc::new(store),
            Arc::new(ResourceRegistry::with_defaults()),
            self.config.clone(),
        ))
    }
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).context("Invalid run ID format (expected UUID)")
}

fn parse_json_arg(value: &str, what: &str) -> Result<Value> {
    serde_json::from_str(value).with_context(|| format!("{} must be valid JSON", what))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("definition")
        .to_string()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// POST a JSON body to the decision API of a running server
async fn remote_post(server: &str, path: &str, body: &Value) -> Result<Value> {
    let url = url::Url::parse(server)
        .and_then(|base| base.join(path))
        .with_context(|| format!("Invalid server URL '{}'", server))?;

    let response = reqwest::Client::new()
        .post(url.clone())
        .json(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .context("Server returned a non-JSON response")?;
    if !status.is_success() {
        let message = payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        anyhow::bail!("Server returned {}: {}", status, message);
    }
    Ok(payload)
}

/// Handle validate command
pub async fn handle_validate(file: String, json: bool) -> Result<()> {
    let path = PathBuf::from(&file);
    let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", file))?;

    match parse_definition(&file_stem(&path), &text) {
        Ok(definition) => {
            let warnings = WorkflowValidator::validate_definition(&definition).warnings;
            if json {
                print_json(&serde_json::json!({
                    "valid": true,
                    "name": definition.name,
                    "states": definition.graph.states.len(),
                    "warnings": warnings,
                }))?;
            } else {
                println!("✅ Definition '{}' is valid", definition.name);
                println!("   Start state: {}", definition.graph.start_at);
                println!("   States: {}", definition.graph.states.len());
                if !warnings.is_empty() {
                    println!();
                    println!("Warnings:");
                    for warning in &warnings {
                        println!("  ⚠  {}", warning);
                    }
                }
            }
            Ok(())
        }
        Err(error) => {
            if json {
                print_json(&serde_json::json!({
                    "valid": false,
                    "issues": error.issues,
                }))?;
            } else {
                println!("❌ Definition validation failed:");
                for issue in &error.issues {
                    println!("  ✗ {}", issue);
                }
            }
            Err(anyhow::anyhow!("Definition validation failed"))
        }
    }
}

/// Handle render command
pub async fn handle_render(file: String, format: RenderFormat) -> Result<()> {
    let path = PathBuf::from(&file);
    let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", file))?;
    let definition = parse_definition(&file_stem(&path), &text)?;

    match format {
        RenderFormat::Json => println!("{}", serialize_definition(&definition)?),
        RenderFormat::Yaml => print!("{}", serde_yaml::to_string(&to_document(&definition))?),
    }
    Ok(())
}

/// Handle publish command
pub async fn handle_publish(
    ctx: &CliContext,
    path: String,
    name: Option<String>,
    json: bool,
) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let path = PathBuf::from(path);

    let mut published = Vec::new();
    let mut failed = Vec::new();

    if path.is_dir() {
        for loaded in load_definitions_from_dir(&path)? {
            match loaded.result {
                Ok(definition) => {
                    let version = orchestrator.publish_definition(&definition).await?;
                    published.push((loaded.name, version));
                }
                Err(error) => failed.push((loaded.name, error)),
            }
        }
    } else {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = name.unwrap_or_else(|| file_stem(&path));
        match parse_definition(&name, &text) {
            Ok(definition) => {
                let version = orchestrator.publish_definition(&definition).await?;
                published.push((name, version));
            }
            Err(error) => failed.push((name, error)),
        }
    }

    if json {
        print_json(&serde_json::json!({
            "published": published
                .iter()
                .map(|(name, version)| serde_json::json!({"name": name, "version": version}))
                .collect::<Vec<_>>(),
            "failed": failed
                .iter()
                .map(|(name, error)| serde_json::json!({"name": name, "issues": error.issues}))
                .collect::<Vec<_>>(),
        }))?;
    } else {
        for (name, version) in &published {
            println!("✅ Published '{}' version {}", name, version);
        }
        for (name, error) in &failed {
            println!("❌ '{}' rejected:", name);
            for issue in &error.issues {
                println!("  ✗ {}", issue);
            }
        }
    }

    if !failed.is_empty() {
        return Err(anyhow::anyhow!("{} definition(s) failed validation", failed.len()));
    }
    Ok(())
}

/// Handle definitions command
pub async fn handle_definitions(ctx: &CliContext, json: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let records = orchestrator.list_definitions().await?;

    if json {
        let output: Vec<_> = records
            .iter()
            .map(|record| {
                serde_json::json!({
                    "name": record.name,
                    "version": record.version,
                    "published_at": record.published_at.to_rfc3339(),
                })
            })
            .collect();
        print_json(&output)?;
    } else if records.is_empty() {
        println!("No definitions published.");
    } else {
        println!("Published definitions:");
        for record in &records {
            println!(
                "  • {} v{} (published {})",
                record.name,
                record.version,
                record.published_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

fn print_run(run: &Run) {
    println!("Run:            {}", run.id);
    println!("Definition:     {} v{}", run.definition, run.definition_version);
    println!("Status:         {:?}", run.status);
    println!("SLA:            {:?} (deadline {})", run.sla_status, run.sla_deadline.format("%Y-%m-%d %H:%M:%S"));
    if let Some(state) = run.current_state() {
        println!("Current State:  {}", state);
    }
    println!("Initiator:      {}", run.initiator);
    println!("Created At:     {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed_at) = run.completed_at {
        println!("Completed At:   {}", completed_at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(failure) = &run.failure {
        println!("Failure:        {}: {}", failure.error, failure.cause);
    }
}

/// Handle start command
pub async fn handle_start(
    ctx: &CliContext,
    definition: String,
    input: String,
    initiator: String,
    deadline_seconds: Option<u64>,
    json: bool,
) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let input = parse_json_arg(&input, "--input")?;

    let run = match deadline_seconds {
        Some(seconds) => {
            let deadline = Utc::now() + Duration::seconds(seconds as i64);
            orchestrator
                .start_run_with_deadline(&definition, input, &initiator, deadline)
                .await
        }
        None => orchestrator.start_run(&definition, input, &initiator).await,
    }
    .with_context(|| format!("Failed to start '{}'", definition))?;

    if json {
        print_json(&run)?;
    } else {
        println!("✅ Started run of '{}'", definition);
        print_run(&run);
        println!();
        println!("Use 'flowgate status {}' to check progress", run.id);
    }
    Ok(())
}

/// Handle status command
pub async fn handle_status(ctx: &CliContext, run_id: String, json: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let run_id = parse_run_id(&run_id)?;
    let run = orchestrator.get_run(run_id).await?;
    let pending = orchestrator.pending_approvals(Some(run_id)).await?;

    if json {
        print_json(&serde_json::json!({ "run": run, "pending_approvals": pending }))?;
    } else {
        print_run(&run);
        if !pending.is_empty() {
            println!();
            println!("Pending approvals:");
            for task in &pending {
                println!("  • {} (role: {})", task.state_id, task.role);
            }
        }
    }
    Ok(())
}

/// Handle runs command
pub async fn handle_runs(ctx: &CliContext, active: bool, json: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let mut runs = orchestrator.list_runs().await?;
    if active {
        runs.retain(|run| !run.is_terminal());
    }
    runs.sort_by_key(|run| run.created_at);

    if json {
        print_json(&runs)?;
    } else if runs.is_empty() {
        println!("No runs found.");
    } else {
        for run in &runs {
            println!(
                "  • {} {} v{} {:?} (SLA {:?})",
                run.id, run.definition, run.definition_version, run.status, run.sla_status
            );
        }
    }
    Ok(())
}

/// Handle approve/reject commands
#[allow(clippy::too_many_arguments)]
pub async fn handle_decision(
    ctx: &CliContext,
    run_id: String,
    state_id: String,
    decision: Decision,
    actor: String,
    comment: Option<String>,
    server: String,
    json: bool,
) -> Result<()> {
    let run_uuid = parse_run_id(&run_id)?;

    let resolution = if server.is_empty() {
        let orchestrator = ctx.orchestrator()?;
        let resolution = orchestrator
            .resolve(run_uuid, &state_id, decision, &actor, comment)
            .await
            .context("Failed to record decision")?;
        serde_json::to_value(&resolution)?
    } else {
        let decision = match decision {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        };
        remote_post(
            &server,
            &format!("/api/v1/runs/{}/decisions", run_uuid),
            &serde_json::json!({
                "state_id": state_id,
                "decision": decision,
                "actor": actor,
                "comment": comment,
            }),
        )
        .await?
    };

    if json {
        print_json(&resolution)?;
    } else {
        let verb = match decision {
            Decision::Approved => "Approved",
            Decision::Rejected => "Rejected",
        };
        println!("✅ {} '{}' on run {}", verb, state_id, run_uuid);
        if let Some(outcome) = resolution.get("outcome").and_then(Value::as_str) {
            println!("   Outcome: {}", outcome);
        }
    }
    Ok(())
}

/// Handle notify command
pub async fn handle_notify(
    ctx: &CliContext,
    run_id: String,
    event_type: String,
    payload: String,
    server: String,
    json: bool,
) -> Result<()> {
    let run_uuid = parse_run_id(&run_id)?;
    let payload = parse_json_arg(&payload, "--payload")?;

    let matched = if server.is_empty() {
        ctx.orchestrator()?
            .notify(run_uuid, &event_type, payload)
            .await
            .context("Failed to deliver event")?
    } else {
        let response = remote_post(
            &server,
            &format!("/api/v1/runs/{}/events", run_uuid),
            &serde_json::json!({ "event_type": event_type, "payload": payload }),
        )
        .await?;
        response.get("matched").and_then(Value::as_u64).unwrap_or(0) as usize
    };

    if json {
        print_json(&serde_json::json!({
            "run_id": run_uuid,
            "event_type": event_type,
            "matched": matched,
        }))?;
    } else if matched == 0 {
        println!("No cursor of run {} was waiting for '{}'", run_uuid, event_type);
    } else {
        println!("✅ Delivered '{}' to {} cursor(s)", event_type, matched);
    }
    Ok(())
}

/// Handle approvals command
pub async fn handle_approvals(ctx: &CliContext, run: Option<String>, json: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let run_id = run.as_deref().map(parse_run_id).transpose()?;
    let tasks = orchestrator.pending_approvals(run_id).await?;

    if json {
        print_json(&tasks)?;
    } else if tasks.is_empty() {
        println!("No pending approvals.");
    } else {
        println!("Pending approvals:");
        for task in &tasks {
            println!("  • run {} state '{}' (role: {})", task.run_id, task.state_id, task.role);
            if let Some(description) = &task.description {
                println!("    {}", description);
            }
            println!("    Requested: {}", task.requested_at.format("%Y-%m-%d %H:%M:%S"));
        }
    }
    Ok(())
}

/// Handle audit command
pub async fn handle_audit(ctx: &CliContext, run_id: String, json: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let entries = orchestrator.audit(parse_run_id(&run_id)?).await?;

    if json {
        print_json(&entries)?;
    } else {
        for entry in &entries {
            println!(
                "{:>5}  {}  {:<24} {:<16} {:<12} {}",
                entry.sequence,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.action.as_str(),
                entry.state_id.as_deref().unwrap_or("-"),
                entry.actor,
                if entry.detail.is_null() {
                    String::new()
                } else {
                    entry.detail.to_string()
                }
            );
        }
    }
    Ok(())
}

/// Handle tick command
pub async fn handle_tick(ctx: &CliContext, server: String, json: bool) -> Result<()> {
    let report = if server.is_empty() {
        serde_json::to_value(ctx.orchestrator()?.tick().await?)?
    } else {
        remote_post(&server, "/api/v1/tick", &Value::Null).await?
    };

    if json {
        print_json(&report)?;
    } else {
        println!("✅ Tick complete");
        if let Value::Object(counters) = &report {
            for (name, value) in counters {
                println!("   {}: {}", name, value);
            }
        }
    }
    Ok(())
}

/// Handle cancel command
pub async fn handle_cancel(
    ctx: &CliContext,
    run_id: String,
    actor: String,
    reason: Option<String>,
    json: bool,
) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let run = orchestrator
        .cancel(parse_run_id(&run_id)?, &actor, reason.as_deref())
        .await
        .context("Failed to cancel run")?;

    if json {
        print_json(&run)?;
    } else {
        println!("✅ Cancelled run {}", run.id);
    }
    Ok(())
}
