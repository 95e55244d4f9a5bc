//! Workflow orchestration and run lifecycle management

use crate::models::configuration::Configuration;
use crate::models::definition::Definition;
use crate::models::workflow::{
    ApprovalTask, AuditAction, AuditEntry, Decision, Escalation, Run, RunStatus,
};
use crate::workflow::approvals::{self, Resolution};
use crate::workflow::audit::{self, ACTOR_SCHEDULER};
use crate::workflow::clock::{checked_offset, Clock, SystemClock};
use crate::workflow::error::{WorkflowError, WorkflowResult};
use crate::workflow::interpreter::{Interpreter, Transaction};
use crate::workflow::parser;
use crate::workflow::resource::ResourceRegistry;
use crate::workflow::sla::{self, SlaPolicy};
use crate::workflow::store::{DefinitionRecord, RunStore, StoreOp};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Counters from one scheduler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Non-terminal runs looked at
    pub runs_examined: usize,
    /// Runs whose due waits or backoffs were resumed
    pub cursors_woken: usize,
    /// Runs failed for exceeding the definition timeout
    pub runs_timed_out: usize,
    /// SLA status changes recorded
    pub sla_transitions: usize,
    /// Runs escalated for being overdue
    pub escalations_raised: usize,
    /// Runs that completed during the tick
    pub runs_completed: usize,
    /// Runs that failed during the tick
    pub runs_failed: usize,
}

struct Inner {
    /// Persistence layer
    store: Arc<dyn RunStore>,
    /// Task resource handlers
    resources: Arc<ResourceRegistry>,
    /// Time source
    clock: Arc<dyn Clock>,
    /// Engine and SLA settings
    config: Configuration,
    /// Single-writer lock per run
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Parsed definitions by (name, version)
    definitions: DashMap<(String, u32), Arc<Definition>>,
    /// Pending wake timers (auto-wake only)
    timers: DashMap<Uuid, JoinHandle<()>>,
}

/// Workflow orchestrator: entry point for publishing, running and deciding
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
}

impl WorkflowOrchestrator {
    /// Create new workflow orchestrator on the wall clock
    pub fn new(store: Arc<dyn RunStore>, resources: Arc<ResourceRegistry>, config: Configuration) -> Self {
        Self::with_clock(store, resources, config, Arc::new(SystemClock))
    }

    /// Create new workflow orchestrator with an explicit time source
    pub fn with_clock(
        store: Arc<dyn RunStore>,
        resources: Arc<ResourceRegistry>,
        config: Configuration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                resources,
                clock,
                config,
                run_locks: DashMap::new(),
                definitions: DashMap::new(),
                timers: DashMap::new(),
            }),
        }
    }

    /// Get store reference
    pub fn store(&self) -> Arc<dyn RunStore> {
        self.inner.store.clone()
    }

    pub fn resources(&self) -> Arc<ResourceRegistry> {
        self.inner.resources.clone()
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    async fn lock_run(&self, run_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .run_locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn interpreter<'a>(&'a self, definition: &'a Definition) -> Interpreter<'a> {
        Interpreter::new(
            definition,
            &self.inner.resources,
            self.inner.clock.as_ref(),
            self.inner.config.engine.max_backoff_seconds as f64,
        )
    }

    /// Parse, validate and store a definition; fails closed on any validation issue
    pub async fn publish(&self, name: &str, text: &str) -> WorkflowResult<u32> {
        let definition = parser::parse_definition(name, text)?;
        self.publish_definition(&definition).await
    }

    /// Store an already validated definition as a new version
    pub async fn publish_definition(&self, definition: &Definition) -> WorkflowResult<u32> {
        let version = self
            .inner
            .store
            .publish_definition(&definition.name, parser::to_document(definition), self.now())
            .await?;

        let mut published = definition.clone();
        published.version = version;
        self.inner
            .definitions
            .insert((published.name.clone(), version), Arc::new(published));

        tracing::info!(definition = %definition.name, version, "published definition");
        Ok(version)
    }

    /// Latest version of every published definition
    pub async fn list_definitions(&self) -> WorkflowResult<Vec<DefinitionRecord>> {
        Ok(self.inner.store.list_definitions().await?)
    }

    /// Load a definition version (`None` = latest), parsed and cached
    pub async fn definition(&self, name: &str, version: Option<u32>) -> WorkflowResult<Arc<Definition>> {
        if let Some(version) = version {
            if let Some(cached) = self.inner.definitions.get(&(name.to_string(), version)) {
                return Ok(cached.clone());
            }
        }
        let record = self.inner.store.load_definition(name, version).await?;
        let key = (record.name.clone(), record.version);
        if let Some(cached) = self.inner.definitions.get(&key) {
            return Ok(cached.clone());
        }
        let definition = Arc::new(record.definition()?);
        self.inner.definitions.insert(key, definition.clone());
        Ok(definition)
    }

    /// Start a run of the latest version of `name` with the configured SLA deadline
    pub async fn start_run(&self, name: &str, input: Value, initiator: &str) -> WorkflowResult<Run> {
        let deadline = checked_offset(self.now(), self.inner.config.sla.default_deadline_seconds as f64)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.start_run_with_deadline(name, input, initiator, deadline).await
    }

    /// Start a run and advance it until every cursor is suspended or the run ends
    pub async fn start_run_with_deadline(
        &self,
        name: &str,
        input: Value,
        initiator: &str,
        sla_deadline: DateTime<Utc>,
    ) -> WorkflowResult<Run> {
        let definition = self.definition(name, None).await?;
        let now = self.now();
        let run = Run::new(
            &definition.name,
            definition.version,
            input,
            initiator.to_string(),
            now,
            sla_deadline,
        );
        let run_id = run.id;
        let _guard = self.lock_run(run_id).await;

        let interpreter = self.interpreter(&definition);
        let mut tx = Transaction::create(run, now);
        tx.audit(
            None,
            AuditAction::RunCreated,
            initiator,
            json!({
                "definition": definition.name,
                "version": definition.version,
                "sla_deadline": sla_deadline,
            }),
        );
        interpreter.start(&mut tx);
        interpreter.advance(&mut tx).await;

        let run = self.commit(tx).await?;
        tracing::info!(run_id = %run_id, definition = %definition.name, status = ?run.status, "started run");
        Ok(run)
    }

    /// Commit a transaction, mirror its audit entries, and re-arm the wake timer
    async fn commit(&self, tx: Transaction) -> WorkflowResult<Run> {
        let batch = tx.into_batch();
        let run = match batch.first() {
            Some(StoreOp::CreateRun(run)) | Some(StoreOp::SaveRun(run)) => run.clone(),
            _ => {
                return Err(WorkflowError::InvalidState(
                    "transaction batch without a run snapshot".to_string(),
                ))
            }
        };
        self.inner.store.commit(batch.clone()).await?;
        audit::trace_batch(&batch);
        self.schedule_wake(&run);
        Ok(run)
    }

    pub async fn get_run(&self, run_id: Uuid) -> WorkflowResult<Run> {
        Ok(self.inner.store.load_run(run_id).await?)
    }

    pub async fn list_runs(&self) -> WorkflowResult<Vec<Run>> {
        Ok(self.inner.store.list_runs().await?)
    }

    /// Audit trail of a run in sequence order
    pub async fn audit(&self, run_id: Uuid) -> WorkflowResult<Vec<AuditEntry>> {
        self.inner.store.load_run(run_id).await?;
        Ok(self.inner.store.audit_entries(run_id).await?)
    }

    /// Pending approval tasks, optionally for one run
    pub async fn pending_approvals(&self, run_id: Option<Uuid>) -> WorkflowResult<Vec<ApprovalTask>> {
        let tasks = self.inner.store.approval_tasks(run_id).await?;
        Ok(tasks.into_iter().filter(|t| t.is_pending()).collect())
    }

    pub async fn escalations(&self, run_id: Option<Uuid>) -> WorkflowResult<Vec<Escalation>> {
        Ok(self.inner.store.escalations(run_id).await?)
    }

    /// Record a human decision on the pending task at `state_id` and resume the run.
    ///
    /// The decision, its audit entries and the resulting cursor moves are
    /// committed together; a second decision on the same task is a conflict.
    pub async fn resolve(
        &self,
        run_id: Uuid,
        state_id: &str,
        decision: Decision,
        actor: &str,
        comment: Option<String>,
    ) -> WorkflowResult<Resolution> {
        let _guard = self.lock_run(run_id).await;
        let run = self.inner.store.load_run(run_id).await?;
        let tasks = self.inner.store.approval_tasks(Some(run_id)).await?;
        let task = approvals::find_pending(&tasks, run_id, state_id)?.clone();
        let escalations = self.inner.store.escalations(Some(run_id)).await?;
        let definition = self.definition(&run.definition, Some(run.definition_version)).await?;

        let interpreter = self.interpreter(&definition);
        let mut tx = Transaction::new(run, self.now()).with_records(tasks.clone(), escalations.clone());
        let outcome = approvals::apply_decision(
            &interpreter,
            &mut tx,
            &task,
            &escalations,
            decision,
            actor,
            comment,
        )?;
        interpreter.advance(&mut tx).await;
        self.commit(tx).await?;

        tracing::info!(run_id = %run_id, state = state_id, ?decision, ?outcome, "resolved approval");
        Ok(Resolution {
            task_id: task.id,
            decision,
            outcome,
        })
    }

    /// Deliver an external event; returns how many cursors it resumed
    pub async fn notify(&self, run_id: Uuid, event_type: &str, payload: Value) -> WorkflowResult<usize> {
        let _guard = self.lock_run(run_id).await;
        let run = self.inner.store.load_run(run_id).await?;
        if run.is_terminal() {
            return Ok(0);
        }
        let definition = self.definition(&run.definition, Some(run.definition_version)).await?;

        let interpreter = self.interpreter(&definition);
        let mut tx = self.open_transaction(run).await?;
        let matched = interpreter.deliver_event(&mut tx, event_type, &payload);
        if matched == 0 {
            return Ok(0);
        }
        interpreter.advance(&mut tx).await;
        self.commit(tx).await?;
        Ok(matched)
    }

    /// Cancel a run: every cursor is retired and pending wake timers are aborted
    pub async fn cancel(&self, run_id: Uuid, actor: &str, reason: Option<&str>) -> WorkflowResult<Run> {
        let _guard = self.lock_run(run_id).await;
        let run = self.inner.store.load_run(run_id).await?;
        if run.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "run {} is already {:?}",
                run_id, run.status
            )));
        }
        let definition = self.definition(&run.definition, Some(run.definition_version)).await?;

        let interpreter = self.interpreter(&definition);
        let mut tx = Transaction::new(run, self.now());
        interpreter.cancel(&mut tx, actor, reason);
        let run = self.commit(tx).await?;
        if let Some((_, timer)) = self.inner.timers.remove(&run_id) {
            timer.abort();
        }
        tracing::info!(run_id = %run_id, actor, "cancelled run");
        Ok(run)
    }

    /// Resume due cursors of one run; returns the committed run when anything changed
    pub async fn wake_run(&self, run_id: Uuid) -> WorkflowResult<Option<Run>> {
        let _guard = self.lock_run(run_id).await;
        let run = self.inner.store.load_run(run_id).await?;
        if run.is_terminal() {
            return Ok(None);
        }
        let definition = self.definition(&run.definition, Some(run.definition_version)).await?;

        let interpreter = self.interpreter(&definition);
        let mut tx = self.open_transaction(run).await?;
        if !interpreter.check_timeout(&mut tx) {
            interpreter.advance(&mut tx).await;
        }
        if !tx.is_dirty() {
            return Ok(None);
        }
        Ok(Some(self.commit(tx).await?))
    }

    /// One scheduler pass over every non-terminal run: resume due waits and
    /// backoffs, apply definition timeouts, then run the SLA monitor
    pub async fn tick(&self) -> WorkflowResult<TickReport> {
        let mut report = TickReport::default();
        let policy = SlaPolicy::from_config(&self.inner.config.sla);
        let runs = self.inner.store.list_non_terminal_runs().await?;

        for candidate in runs {
            let run_id = candidate.id;
            let _guard = self.lock_run(run_id).await;
            let run = self.inner.store.load_run(run_id).await?;
            if run.is_terminal() {
                continue;
            }
            report.runs_examined += 1;

            let definition = match self.definition(&run.definition, Some(run.definition_version)).await {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "skipping run with unloadable definition");
                    continue;
                }
            };
            let interpreter = self.interpreter(&definition);
            let mut tx = self.open_transaction(run).await?;

            if interpreter.check_timeout(&mut tx) {
                report.runs_timed_out += 1;
            } else {
                let due = tx
                    .run
                    .next_resume_at()
                    .is_some_and(|resume_at| resume_at <= tx.now);
                if due {
                    report.cursors_woken += 1;
                    interpreter.advance(&mut tx).await;
                }
            }

            if !tx.run.is_terminal() {
                let tasks = tx.approval_tasks();
                let outcome = sla::evaluate(&policy, &mut tx, &tasks);
                report.sla_transitions += outcome.transitions;
                if outcome.escalated {
                    report.escalations_raised += 1;
                }
            }

            match tx.run.status {
                RunStatus::Completed => report.runs_completed += 1,
                RunStatus::Failed => report.runs_failed += 1,
                _ => {}
            }
            if tx.is_dirty() {
                self.commit(tx).await?;
            }
        }

        tracing::debug!(?report, "tick finished");
        Ok(report)
    }

    /// Open a transaction on `run` carrying its stored approval tasks and escalations
    async fn open_transaction(&self, run: Run) -> WorkflowResult<Transaction> {
        let tasks = self.inner.store.approval_tasks(Some(run.id)).await?;
        let escalations = self.inner.store.escalations(Some(run.id)).await?;
        Ok(Transaction::new(run, self.now()).with_records(tasks, escalations))
    }

    /// Arm a timer that wakes `run` at its earliest resume time (auto-wake only)
    fn schedule_wake(&self, run: &Run) {
        if !self.inner.config.engine.auto_wake {
            return;
        }
        if let Some((_, previous)) = self.inner.timers.remove(&run.id) {
            previous.abort();
        }
        let Some(resume_at) = run.next_resume_at().filter(|_| !run.is_terminal()) else {
            return;
        };

        let delay = (resume_at - self.now()).to_std().unwrap_or_default();
        let orchestrator = self.clone();
        let run_id = run.id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            orchestrator.inner.timers.remove(&run_id);
            if let Err(e) = orchestrator.wake_run(run_id).await {
                tracing::error!(run_id = %run_id, actor = ACTOR_SCHEDULER, error = %e, "wake failed");
            }
        });
        self.inner.timers.insert(run_id, handle);
    }

    /// Number of armed wake timers
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::clock::ManualClock;
    use crate::workflow::store::JsonFileStore;
    use tempfile::tempdir;

    const SIMPLE: &str = r#"{
        "StartAt": "Greet",
        "States": {
            "Greet": {"Type": "Task", "Resource": "builtin:echo", "ResultPath": "$.echo", "End": true}
        }
    }"#;

    #[tokio::test]
    async fn test_orchestrator_start_run() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path().join("flowgate.json")).unwrap());
        let orchestrator = WorkflowOrchestrator::new(
            store,
            Arc::new(ResourceRegistry::with_defaults()),
            Configuration::default(),
        );

        let version = orchestrator.publish("greet", SIMPLE).await.unwrap();
        assert_eq!(version, 1);

        let run = orchestrator
            .start_run("greet", json!({"name": "ada"}), "test-user")
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.data["echo"], json!({"name": "ada"}));

        let stored = orchestrator.get_run(run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        let trail = orchestrator.audit(run.id).await.unwrap();
        assert_eq!(trail.first().map(|e| e.action), Some(AuditAction::RunCreated));
        assert_eq!(trail.last().map(|e| e.action), Some(AuditAction::RunCompleted));
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_definition() {
        let orchestrator = WorkflowOrchestrator::new(
            Arc::new(JsonFileStore::in_memory()),
            Arc::new(ResourceRegistry::new()),
            Configuration::default(),
        );
        let error = orchestrator
            .publish("broken", r#"{"StartAt": "Missing", "States": {}}"#)
            .await
            .unwrap_err();
        assert!(matches!(error, WorkflowError::Validation(_)));
        assert!(orchestrator.list_definitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_resumes_due_wait() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let orchestrator = WorkflowOrchestrator::with_clock(
            Arc::new(JsonFileStore::in_memory()),
            Arc::new(ResourceRegistry::new()),
            Configuration::default(),
            clock.clone(),
        );
        orchestrator
            .publish(
                "pause",
                r#"{"StartAt": "Hold", "States": {
                    "Hold": {"Type": "Wait", "Seconds": 60, "Next": "Done"},
                    "Done": {"Type": "Succeed"}
                }}"#,
            )
            .await
            .unwrap();

        let run = orchestrator.start_run("pause", json!({}), "tester").await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let early = orchestrator.tick().await.unwrap();
        assert_eq!(early.cursors_woken, 0);

        clock.advance_seconds(60);
        let report = orchestrator.tick().await.unwrap();
        assert_eq!(report.cursors_woken, 1);
        assert_eq!(report.runs_completed, 1);
        assert_eq!(orchestrator.get_run(run.id).await.unwrap().status, RunStatus::Completed);
    }
}
