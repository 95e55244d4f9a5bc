//! Execution interpreter: steps the cursors of one run through its definition
//!
//! The interpreter never touches the store. It mutates a [`Transaction`]
//! (a run snapshot plus the store operations produced so far) and the
//! orchestrator commits the transaction as one batch.

use crate::models::definition::{
    ApprovalConfig, Definition, GraphPath, MapSpec, ParallelSpec, State, StateKind, TaskSpec,
    Transition, WaitSpec,
};
use crate::models::workflow::{
    ApprovalOrigin, ApprovalStatus, ApprovalTask, AuditAction, AuditEntry, Cursor, CursorStatus,
    Escalation, EscalationStatus, JoinGroup, JoinKind, JoinSlot, PendingItem, Run, RunFailure,
    RunStatus, SlaStatus, WaitReason,
};
use crate::workflow::audit::ACTOR_ENGINE;
use crate::workflow::clock::{checked_offset, Clock};
use crate::workflow::condition;
use crate::workflow::error::{
    ResourceError, ERROR_APPROVAL_REJECTED, ERROR_FAIL_STATE, ERROR_NO_CHOICE_MATCHED,
};
use crate::workflow::path;
use crate::workflow::resource::{ResourceHandler, ResourceRegistry, EVENT_PREFIX};
use crate::workflow::store::StoreOp;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Scheduling rounds one `advance` call may run before yielding to the scheduler
pub const MAX_ROUNDS_PER_ADVANCE: usize = 1_000;

/// A run snapshot plus the store operations produced while mutating it
pub struct Transaction {
    /// Working copy of the run
    pub run: Run,
    /// Pending store operations, in order
    ops: Vec<StoreOp>,
    /// The run does not exist in the store yet
    created: bool,
    /// Run changed without an accompanying store op
    dirty: bool,
    /// Time used for timestamps in the current step
    pub now: DateTime<Utc>,
    /// Approval tasks of the run as stored when the transaction opened
    tasks: Vec<ApprovalTask>,
    /// Escalations of the run as stored when the transaction opened
    escalations: Vec<Escalation>,
}

impl Transaction {
    /// Open a transaction on a stored run
    pub fn new(run: Run, now: DateTime<Utc>) -> Self {
        Self {
            run,
            ops: Vec::new(),
            created: false,
            dirty: false,
            now,
            tasks: Vec::new(),
            escalations: Vec::new(),
        }
    }

    /// Attach the run's stored approval tasks and escalations
    pub fn with_records(mut self, tasks: Vec<ApprovalTask>, escalations: Vec<Escalation>) -> Self {
        self.tasks = tasks;
        self.escalations = escalations;
        self
    }

    /// Open a transaction that will insert `run`
    pub fn create(run: Run, now: DateTime<Utc>) -> Self {
        Self {
            run,
            ops: Vec::new(),
            created: true,
            dirty: true,
            now,
            tasks: Vec::new(),
            escalations: Vec::new(),
        }
    }

    pub fn push(&mut self, op: StoreOp) {
        self.ops.push(op);
    }

    /// Append an audit entry for this run
    pub fn audit(&mut self, state: Option<&str>, action: AuditAction, actor: &str, detail: Value) {
        let mut entry = AuditEntry::new(self.run.id, action, actor, self.now).with_detail(detail);
        entry.state_id = state.map(str::to_string);
        self.ops.push(StoreOp::AppendAudit(entry));
    }

    /// Mark the run as changed
    pub fn touch(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || !self.ops.is_empty()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    /// Audit actions recorded so far in this transaction
    pub fn audited(&self) -> impl Iterator<Item = AuditAction> + '_ {
        self.ops.iter().filter_map(|op| match op {
            StoreOp::AppendAudit(entry) => Some(entry.action),
            _ => None,
        })
    }

    /// Approval tasks as they will be stored once the batch commits
    pub fn approval_tasks(&self) -> Vec<ApprovalTask> {
        let mut tasks = self.tasks.clone();
        for op in &self.ops {
            match op {
                StoreOp::CreateApproval(task) => tasks.push(task.clone()),
                StoreOp::UpdateApproval(task) => {
                    if let Some(existing) = tasks.iter_mut().find(|t| t.id == task.id) {
                        *existing = task.clone();
                    }
                }
                StoreOp::ResolveApproval { task_id, status, .. } => {
                    if let Some(existing) = tasks.iter_mut().find(|t| t.id == *task_id) {
                        existing.status = *status;
                    }
                }
                _ => {}
            }
        }
        tasks
    }

    /// Escalations as they will be stored once the batch commits
    pub fn escalations(&self) -> Vec<Escalation> {
        let mut escalations = self.escalations.clone();
        for op in &self.ops {
            match op {
                StoreOp::CreateEscalation(escalation) => escalations.push(escalation.clone()),
                StoreOp::UpdateEscalation(escalation) => {
                    if let Some(existing) = escalations.iter_mut().find(|e| e.id == escalation.id) {
                        *existing = escalation.clone();
                    }
                }
                _ => {}
            }
        }
        escalations
    }

    /// Finish the transaction: the run snapshot first, then every other op
    pub fn into_batch(mut self) -> Vec<StoreOp> {
        self.run.updated_at = self.now;
        let run_op = if self.created {
            StoreOp::CreateRun(self.run)
        } else {
            StoreOp::SaveRun(self.run)
        };
        let mut batch = Vec::with_capacity(self.ops.len() + 1);
        batch.push(run_op);
        batch.extend(self.ops);
        batch
    }
}

/// Key an approval task is stored under: the state id for root cursors,
/// qualified by graph path (and Map item) for nested ones
pub fn approval_key(run: &Run, cursor: &Cursor) -> String {
    if cursor.graph.is_root() {
        return cursor.state.clone();
    }
    let mut scope = cursor.graph.to_string();
    if let Some(slot) = cursor.join {
        let is_map = run
            .join_groups
            .get(&slot.group_id)
            .is_some_and(|group| group.kind == JoinKind::Map);
        if is_map {
            scope = format!("{}#{}", scope, slot.slot);
        }
    }
    format!("{}/{}", scope, cursor.state)
}

/// Close a pending SLA review in favour of the gate task `gate_id`.
///
/// The review is marked superseded and any open escalation pointing at it
/// now points at the gate, so deciding the gate closes the escalation.
fn take_over_review(tx: &mut Transaction, review: &ApprovalTask, gate_id: Uuid) {
    tx.push(StoreOp::ResolveApproval {
        task_id: review.id,
        status: ApprovalStatus::Superseded,
        actor: ACTOR_ENGINE.to_string(),
        comment: Some(format!("superseded by gate task {}", gate_id)),
        at: tx.now,
    });
    let retargeted: Vec<Escalation> = tx
        .escalations()
        .into_iter()
        .filter(|e| e.status == EscalationStatus::Open && e.target_task == Some(review.id))
        .map(|mut e| {
            e.target_task = Some(gate_id);
            e
        })
        .collect();
    for escalation in retargeted {
        tx.push(StoreOp::UpdateEscalation(escalation));
    }
    tracing::info!(
        run_id = %tx.run.id,
        state = %review.state_id,
        review = %review.id,
        gate = %gate_id,
        "gate task took over pending SLA review"
    );
}

/// A Task call prepared under the run lock and awaited outside of it
struct Invocation {
    cursor_id: Uuid,
    resource: String,
    input: Value,
    handler: Arc<dyn ResourceHandler>,
    timeout_seconds: Option<u64>,
}

impl Invocation {
    fn into_future(self) -> BoxFuture<'static, (Uuid, Result<Value, ResourceError>)> {
        let Invocation {
            cursor_id,
            resource,
            input,
            handler,
            timeout_seconds,
        } = self;
        async move {
            let call = handler.invoke(&resource, input);
            let outcome = match timeout_seconds {
                Some(seconds) => tokio::time::timeout(std::time::Duration::from_secs(seconds), call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ResourceError::timeout(format!(
                            "resource '{}' did not finish within {}s",
                            resource, seconds
                        )))
                    }),
                None => call.await,
            };
            (cursor_id, outcome)
        }
        .boxed()
    }
}

/// Steps a run through one definition
pub struct Interpreter<'a> {
    definition: &'a Definition,
    resources: &'a ResourceRegistry,
    clock: &'a dyn Clock,
    max_backoff_seconds: f64,
}

impl<'a> Interpreter<'a> {
    /// Create new interpreter for `definition`
    pub fn new(
        definition: &'a Definition,
        resources: &'a ResourceRegistry,
        clock: &'a dyn Clock,
        max_backoff_seconds: f64,
    ) -> Self {
        Self {
            definition,
            resources,
            clock,
            max_backoff_seconds,
        }
    }

    fn state_of(&self, cursor: &Cursor) -> Option<&'a State> {
        self.definition.state_at(&cursor.graph, &cursor.state)
    }

    fn cursor_state(&self, run: &Run, cursor_id: Uuid) -> Option<&'a State> {
        run.cursor(cursor_id).and_then(|cursor| self.state_of(cursor))
    }

    /// Place the root cursor at the start state
    pub fn start(&self, tx: &mut Transaction) {
        let cursor = Cursor::new(
            GraphPath::root(),
            &self.definition.graph.start_at,
            tx.run.data.clone(),
            tx.now,
        );
        tx.run.cursors.push(cursor);
        tx.touch();
    }

    /// Run ready cursors until every cursor is suspended or the run ends.
    ///
    /// Task calls of one round are in flight together; their outcomes are
    /// applied one at a time.
    pub async fn advance(&self, tx: &mut Transaction) {
        for _ in 0..MAX_ROUNDS_PER_ADVANCE {
            tx.now = self.clock.now();
            if tx.run.is_terminal() {
                break;
            }
            self.wake_due(tx);

            let ready: Vec<Uuid> = tx
                .run
                .cursors
                .iter()
                .filter(|c| c.is_ready())
                .map(|c| c.id)
                .collect();
            if ready.is_empty() {
                break;
            }

            if tx.run.status == RunStatus::Pending {
                tx.run.status = RunStatus::Running;
                tx.audit(None, AuditAction::RunStarted, ACTOR_ENGINE, json!({}));
            }

            let mut in_flight = FuturesUnordered::new();
            for cursor_id in ready {
                if tx.run.is_terminal() {
                    break;
                }
                if let Some(invocation) = self.step(tx, cursor_id) {
                    in_flight.push(invocation.into_future());
                }
            }

            while let Some((cursor_id, outcome)) = in_flight.next().await {
                tx.now = self.clock.now();
                if tx.run.is_terminal() {
                    continue;
                }
                self.apply_task_outcome(tx, cursor_id, outcome);
            }

            self.sync_root_data(tx);
        }
        self.sync_root_data(tx);
    }

    fn sync_root_data(&self, tx: &mut Transaction) {
        if let Some(root) = tx.run.cursors.iter().find(|c| c.graph.is_root()) {
            tx.run.data = root.data.clone();
        }
    }

    /// Resume cursors whose wait or backoff elapsed; returns how many woke
    pub fn wake_due(&self, tx: &mut Transaction) -> usize {
        let now = tx.now;
        let due: Vec<(Uuid, WaitReason)> = tx
            .run
            .cursors
            .iter()
            .filter_map(|c| match c.status {
                CursorStatus::Waiting { resume_at, reason } if resume_at <= now => Some((c.id, reason)),
                _ => None,
            })
            .collect();

        for (cursor_id, reason) in &due {
            match reason {
                WaitReason::Retry => {
                    if let Some(cursor) = tx.run.cursor_mut(*cursor_id) {
                        cursor.status = CursorStatus::Ready;
                    }
                }
                WaitReason::WaitState => self.leave_wait(tx, *cursor_id),
            }
        }
        if !due.is_empty() {
            tx.touch();
        }
        due.len()
    }

    fn leave_wait(&self, tx: &mut Transaction, cursor_id: Uuid) {
        let Some(state) = self.cursor_state(&tx.run, cursor_id) else {
            return;
        };
        let Some(data) = tx.run.cursor(cursor_id).map(|c| c.data.clone()) else {
            return;
        };
        let output = path::filter(&data, state.input_path.as_deref())
            .and_then(|input| path::filter(&input, state.output_path.as_deref()));
        match output {
            Ok(output) => {
                tx.audit(Some(&state.name), AuditAction::WaitElapsed, ACTOR_ENGINE, json!({}));
                self.transition(tx, cursor_id, state, output);
            }
            Err(message) => self.raise(tx, cursor_id, state, ResourceError::runtime(message)),
        }
    }

    /// Step one ready cursor; returns a Task call to await, if any
    fn step(&self, tx: &mut Transaction, cursor_id: Uuid) -> Option<Invocation> {
        let state = match tx.run.cursor(cursor_id) {
            Some(cursor) if cursor.is_ready() => self.state_of(cursor).ok_or_else(|| {
                format!("state '{}' not found in graph {}", cursor.state, cursor.graph)
            }),
            _ => return None,
        };
        let state = match state {
            Ok(state) => state,
            Err(message) => {
                self.fail_run(tx, &ResourceError::runtime(message), None);
                return None;
            }
        };

        let approval_granted = tx.run.cursor(cursor_id)?.approval_granted;
        if let Some(approval) = &state.approval {
            if !approval_granted {
                self.request_approval(tx, cursor_id, state, approval);
                return None;
            }
        }

        let data = tx.run.cursor(cursor_id)?.data.clone();
        let input = match path::filter(&data, state.input_path.as_deref()) {
            Ok(input) => input,
            Err(message) => {
                self.raise(tx, cursor_id, state, ResourceError::runtime(message));
                return None;
            }
        };

        match &state.kind {
            StateKind::Task(task) => return self.start_task(tx, cursor_id, state, task, input),
            StateKind::Pass(pass) => {
                let result = match (&pass.parameters, &pass.result) {
                    (Some(template), _) => path::apply_parameters(template, &input),
                    (None, Some(result)) => Ok(result.clone()),
                    (None, None) => Ok(input),
                };
                match result {
                    Ok(result) => {
                        self.complete_with_result(tx, cursor_id, state, pass.result_path.as_deref(), result)
                    }
                    Err(message) => self.raise(tx, cursor_id, state, ResourceError::runtime(message)),
                }
            }
            StateKind::Choice(choice) => {
                match condition::choose_next(
                    &state.name,
                    &choice.rules,
                    choice.default.as_deref(),
                    &input,
                ) {
                    Ok(next) => match path::filter(&input, state.output_path.as_deref()) {
                        Ok(output) => {
                            tx.audit(
                                Some(&state.name),
                                AuditAction::StepSucceeded,
                                ACTOR_ENGINE,
                                json!({ "next": next }),
                            );
                            let now = tx.now;
                            if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
                                cursor.enter(next, output, now);
                            }
                        }
                        Err(message) => self.raise(tx, cursor_id, state, ResourceError::runtime(message)),
                    },
                    Err(error) => self.raise(
                        tx,
                        cursor_id,
                        state,
                        ResourceError::new(ERROR_NO_CHOICE_MATCHED, error.to_string()),
                    ),
                }
            }
            StateKind::Wait(wait) => self.start_wait(tx, cursor_id, state, wait, &input),
            StateKind::Parallel(parallel) => self.fork_parallel(tx, cursor_id, state, parallel, input),
            StateKind::Map(map) => self.fork_map(tx, cursor_id, state, map, &input),
            StateKind::Succeed => match path::filter(&input, state.output_path.as_deref()) {
                Ok(output) => {
                    tx.audit(Some(&state.name), AuditAction::StepSucceeded, ACTOR_ENGINE, json!({}));
                    self.finish_cursor(tx, cursor_id, output);
                }
                Err(message) => self.raise(tx, cursor_id, state, ResourceError::runtime(message)),
            },
            StateKind::Fail(fail) => {
                let error = ResourceError::new(
                    fail.error.as_deref().unwrap_or(ERROR_FAIL_STATE),
                    fail.cause.clone().unwrap_or_default(),
                );
                tx.audit(
                    Some(&state.name),
                    AuditAction::StepFailed,
                    ACTOR_ENGINE,
                    json!({ "error": error.error, "cause": error.cause }),
                );
                self.fail_cursor(tx, cursor_id, &state.name, error);
            }
        }
        None
    }

    fn request_approval(
        &self,
        tx: &mut Transaction,
        cursor_id: Uuid,
        state: &State,
        approval: &ApprovalConfig,
    ) {
        let Some(key) = tx.run.cursor(cursor_id).map(|cursor| approval_key(&tx.run, cursor)) else {
            return;
        };
        // an SLA review already open on this key hands its role to the gate
        let review = tx.approval_tasks().into_iter().find(|t| {
            t.run_id == tx.run.id
                && t.state_id == key
                && t.origin == ApprovalOrigin::SlaEscalation
                && t.is_pending()
        });
        let role = review.as_ref().map_or(approval.role.as_str(), |r| r.role.as_str());
        let mut task = ApprovalTask::new(tx.run.id, &key, role, ApprovalOrigin::StateGate, tx.now);
        task.cursor_id = Some(cursor_id);
        task.description = approval.description.clone();
        let task_id = task.id;
        let role = task.role.clone();

        if let Some(review) = &review {
            take_over_review(tx, review, task_id);
        }
        if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
            cursor.status = CursorStatus::AwaitingApproval { task_id };
        }
        tx.push(StoreOp::CreateApproval(task));
        let mut detail = json!({ "task_id": task_id, "role": role, "key": key });
        if let Some(review) = &review {
            detail["superseded"] = json!(review.id);
        }
        tx.audit(Some(&state.name), AuditAction::ApprovalRequested, ACTOR_ENGINE, detail);
    }

    fn start_task(
        &self,
        tx: &mut Transaction,
        cursor_id: Uuid,
        state: &State,
        task: &TaskSpec,
        input: Value,
    ) -> Option<Invocation> {
        if let Some(event_type) = task.resource.strip_prefix(EVENT_PREFIX) {
            if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
                cursor.status = CursorStatus::AwaitingEvent {
                    event_type: event_type.to_string(),
                };
            }
            tx.audit(
                Some(&state.name),
                AuditAction::EventAwaited,
                ACTOR_ENGINE,
                json!({ "event_type": event_type }),
            );
            return None;
        }

        let input = match &task.parameters {
            Some(template) => match path::apply_parameters(template, &input) {
                Ok(input) => input,
                Err(message) => {
                    self.raise(tx, cursor_id, state, ResourceError::runtime(message));
                    return None;
                }
            },
            None => input,
        };

        let Some(handler) = self.resources.resolve(&task.resource) else {
            self.raise(
                tx,
                cursor_id,
                state,
                ResourceError::task_failed(format!(
                    "no handler registered for resource '{}'",
                    task.resource
                )),
            );
            return None;
        };

        tracing::debug!(run_id = %tx.run.id, state = %state.name, resource = %task.resource, "invoking resource");
        Some(Invocation {
            cursor_id,
            resource: task.resource.clone(),
            input,
            handler,
            timeout_seconds: task.timeout_seconds,
        })
    }

    fn apply_task_outcome(
        &self,
        tx: &mut Transaction,
        cursor_id: Uuid,
        outcome: Result<Value, ResourceError>,
    ) {
        let Some(state) = self.cursor_state(&tx.run, cursor_id) else {
            tracing::debug!(run_id = %tx.run.id, cursor = %cursor_id, "discarding result of retired cursor");
            return;
        };
        let StateKind::Task(task) = &state.kind else {
            return;
        };
        match outcome {
            Ok(result) => self.complete_with_result(tx, cursor_id, state, task.result_path.as_deref(), result),
            Err(error) => self.raise(tx, cursor_id, state, error),
        }
    }

    /// Merge `result` at `result_path`, apply `OutputPath`, then follow the transition
    fn complete_with_result(
        &self,
        tx: &mut Transaction,
        cursor_id: Uuid,
        state: &State,
        result_path: Option<&str>,
        result: Value,
    ) {
        let Some(data) = tx.run.cursor(cursor_id).map(|c| c.data.clone()) else {
            return;
        };
        let output = path::merge_result(&data, result_path, result)
            .and_then(|merged| path::filter(&merged, state.output_path.as_deref()));
        match output {
            Ok(output) => {
                tx.audit(Some(&state.name), AuditAction::StepSucceeded, ACTOR_ENGINE, json!({}));
                self.transition(tx, cursor_id, state, output);
            }
            Err(message) => self.raise(tx, cursor_id, state, ResourceError::runtime(message)),
        }
    }

    fn transition(&self, tx: &mut Transaction, cursor_id: Uuid, state: &State, output: Value) {
        match &state.transition {
            Some(Transition::Next(next)) => {
                let now = tx.now;
                if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
                    cursor.enter(next, output, now);
                }
            }
            _ => self.finish_cursor(tx, cursor_id, output),
        }
    }

    fn start_wait(
        &self,
        tx: &mut Transaction,
        cursor_id: Uuid,
        state: &State,
        wait: &WaitSpec,
        input: &Value,
    ) {
        let now = tx.now;
        let resume_at = match wait {
            WaitSpec::Seconds(seconds) => checked_offset(now, *seconds as f64)
                .ok_or_else(|| format!("Seconds={} is out of range", seconds)),
            WaitSpec::Timestamp(at) => Ok(*at),
            WaitSpec::SecondsPath(p) => path::select(input, p).and_then(|value| {
                let seconds = value
                    .and_then(Value::as_f64)
                    .filter(|seconds| *seconds >= 0.0)
                    .ok_or_else(|| format!("SecondsPath '{}' did not select a non-negative number", p))?;
                checked_offset(now, seconds)
                    .ok_or_else(|| format!("SecondsPath '{}' selected {} seconds, which is out of range", p, seconds))
            }),
            WaitSpec::TimestampPath(p) => path::select(input, p).and_then(|value| {
                value
                    .and_then(Value::as_str)
                    .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
                    .map(|at| at.with_timezone(&Utc))
                    .ok_or_else(|| format!("TimestampPath '{}' did not select an RFC 3339 timestamp", p))
            }),
        };

        match resume_at {
            Ok(resume_at) => {
                if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
                    cursor.status = CursorStatus::Waiting {
                        resume_at,
                        reason: WaitReason::WaitState,
                    };
                }
                tx.audit(
                    Some(&state.name),
                    AuditAction::WaitScheduled,
                    ACTOR_ENGINE,
                    json!({ "resume_at": resume_at }),
                );
            }
            Err(message) => self.raise(tx, cursor_id, state, ResourceError::runtime(message)),
        }
    }

    fn fork_parallel(
        &self,
        tx: &mut Transaction,
        cursor_id: Uuid,
        state: &State,
        parallel: &ParallelSpec,
        input: Value,
    ) {
        let Some(parent_graph) = tx.run.cursor(cursor_id).map(|c| c.graph.clone()) else {
            return;
        };
        let now = tx.now;
        let mut group = JoinGroup::new(cursor_id, JoinKind::Parallel, parallel.branches.len(), 0);
        let group_id = group.id;

        for (index, branch) in parallel.branches.iter().enumerate() {
            let mut child = Cursor::new(
                parent_graph.branch(&state.name, index),
                &branch.start_at,
                input.clone(),
                now,
            );
            child.join = Some(JoinSlot {
                group_id,
                slot: index,
            });
            group.start_child();
            tx.run.cursors.push(child);
        }

        tx.run.join_groups.insert(group_id, group);
        if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
            cursor.status = CursorStatus::AwaitingJoin { group_id };
        }
        tx.audit(
            Some(&state.name),
            AuditAction::BranchesForked,
            ACTOR_ENGINE,
            json!({ "group_id": group_id, "kind": "parallel", "branches": parallel.branches.len() }),
        );
    }

    fn fork_map(
        &self,
        tx: &mut Transaction,
        cursor_id: Uuid,
        state: &State,
        map: &MapSpec,
        input: &Value,
    ) {
        let items = match path::select(input, &map.items_path) {
            Ok(Some(Value::Array(items))) => items.clone(),
            Ok(_) => {
                self.raise(
                    tx,
                    cursor_id,
                    state,
                    ResourceError::runtime(format!(
                        "ItemsPath '{}' did not select an array",
                        map.items_path
                    )),
                );
                return;
            }
            Err(message) => {
                self.raise(tx, cursor_id, state, ResourceError::runtime(message));
                return;
            }
        };

        if items.is_empty() {
            self.complete_fork(tx, cursor_id, Vec::new());
            return;
        }

        let Some(parent_graph) = tx.run.cursor(cursor_id).map(|c| c.graph.clone()) else {
            return;
        };
        let graph = parent_graph.iterator(&state.name);
        let now = tx.now;
        let total = items.len();
        let mut group = JoinGroup::new(cursor_id, JoinKind::Map, total, map.max_concurrency as usize);
        let group_id = group.id;

        for (index, value) in items.into_iter().enumerate() {
            if group.has_capacity() {
                group.start_child();
                let child = map_child(&graph, &map.iterator.start_at, group_id, index, value, now);
                tx.run.cursors.push(child);
            } else {
                group.pending.push_back(PendingItem { index, value });
            }
        }

        let started = group.active;
        tx.run.join_groups.insert(group_id, group);
        if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
            cursor.status = CursorStatus::AwaitingJoin { group_id };
        }
        tx.audit(
            Some(&state.name),
            AuditAction::BranchesForked,
            ACTOR_ENGINE,
            json!({
                "group_id": group_id,
                "kind": "map",
                "items": total,
                "started": started,
                "max_concurrency": map.max_concurrency,
            }),
        );
    }

    /// Place fork results on the parent and move it on
    fn complete_fork(&self, tx: &mut Transaction, parent_id: Uuid, results: Vec<Value>) {
        let Some(state) = self.cursor_state(&tx.run, parent_id) else {
            return;
        };
        let result_path = match &state.kind {
            StateKind::Parallel(parallel) => parallel.result_path.as_deref(),
            StateKind::Map(map) => map.result_path.as_deref(),
            _ => None,
        };
        self.complete_with_result(tx, parent_id, state, result_path, Value::Array(results));
    }

    /// A cursor reached the end of its graph
    fn finish_cursor(&self, tx: &mut Transaction, cursor_id: Uuid, output: Value) {
        let Some(cursor) = tx.run.take_cursor(cursor_id) else {
            return;
        };

        let Some(slot) = cursor.join else {
            self.complete_run(tx, output);
            return;
        };

        let now = tx.now;
        let Some(group) = tx.run.join_groups.get_mut(&slot.group_id) else {
            tracing::warn!(run_id = %tx.run.id, group = %slot.group_id, "child finished without a join group");
            return;
        };

        let released = group.arrive(slot.slot, output);
        if !released && group.has_capacity() {
            if let Some(item) = group.pending.pop_front() {
                group.start_child();
                let start_at = self
                    .definition
                    .graph_at(&cursor.graph)
                    .map(|graph| graph.start_at.clone())
                    .unwrap_or_default();
                let child = map_child(&cursor.graph, &start_at, slot.group_id, item.index, item.value, now);
                tx.run.cursors.push(child);
            }
        }

        if released {
            if let Some(group) = tx.run.join_groups.remove(&slot.group_id) {
                let parent_state = tx.run.cursor(group.parent).map(|c| c.state.clone());
                tx.audit(
                    parent_state.as_deref(),
                    AuditAction::JoinReleased,
                    ACTOR_ENGINE,
                    json!({
                        "group_id": group.id,
                        "kind": group.kind,
                        "results": group.results.len(),
                        "peak_active": group.peak_active,
                    }),
                );
                self.complete_fork(tx, group.parent, group.results);
            }
        }
    }

    fn complete_run(&self, tx: &mut Transaction, output: Value) {
        tx.run.data = output;
        tx.run.status = RunStatus::Completed;
        tx.run.completed_at = Some(tx.now);
        tx.run.cursors.clear();
        tx.run.join_groups.clear();
        self.mark_sla_completed(tx);
        tx.audit(None, AuditAction::RunCompleted, ACTOR_ENGINE, json!({}));
        tracing::info!(run_id = %tx.run.id, definition = %tx.run.definition, "run completed");
    }

    fn mark_sla_completed(&self, tx: &mut Transaction) {
        let previous = tx.run.sla_status;
        if previous != SlaStatus::Completed {
            tx.run.sla_status = SlaStatus::Completed;
            tx.audit(
                None,
                AuditAction::SlaStatusChanged,
                ACTOR_ENGINE,
                json!({ "from": previous, "to": SlaStatus::Completed }),
            );
        }
    }

    /// Route an error through the state's retriers and catchers
    fn raise(&self, tx: &mut Transaction, cursor_id: Uuid, state: &State, error: ResourceError) {
        tx.audit(
            Some(&state.name),
            AuditAction::StepFailed,
            ACTOR_ENGINE,
            json!({ "error": error.error, "cause": error.cause }),
        );

        let now = tx.now;
        let Some(cursor) = tx.run.cursor_mut(cursor_id) else {
            return;
        };

        if let Some((index, rule)) = state
            .retry
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(&error.error))
        {
            let used = cursor.retry_counts.get(&index).copied().unwrap_or(0);
            if used < rule.max_attempts {
                let attempt = used + 1;
                let delay = rule.delay_seconds(attempt, self.max_backoff_seconds);
                let resume_at = checked_offset(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
                cursor.retry_counts.insert(index, attempt);
                cursor.status = CursorStatus::Waiting {
                    resume_at,
                    reason: WaitReason::Retry,
                };
                tx.audit(
                    Some(&state.name),
                    AuditAction::RetryScheduled,
                    ACTOR_ENGINE,
                    json!({
                        "error": error.error,
                        "attempt": attempt,
                        "max_attempts": rule.max_attempts,
                        "delay_seconds": delay,
                        "resume_at": resume_at,
                    }),
                );
                return;
            }
        }

        if let Some(catcher) = state.catch.iter().find(|catcher| catcher.matches(&error.error)) {
            let mut detail = json!({ "error": error.error, "cause": error.cause, "next": catcher.next });
            let data = match &catcher.result_path {
                Some(result_path) => {
                    match path::merge_result(&cursor.data, Some(result_path), error.to_value()) {
                        Ok(data) => data,
                        Err(message) => {
                            detail["result_path_error"] = json!(message);
                            cursor.data.clone()
                        }
                    }
                }
                None => cursor.data.clone(),
            };
            cursor.enter(&catcher.next, data, now);
            tx.audit(Some(&state.name), AuditAction::CatchRouted, ACTOR_ENGINE, detail);
            return;
        }

        tx.audit(
            Some(&state.name),
            AuditAction::StepFailureUnhandled,
            ACTOR_ENGINE,
            json!({ "error": error.error, "cause": error.cause }),
        );
        self.fail_cursor(tx, cursor_id, &state.name, error);
    }

    /// Fail a cursor: a child fails its whole fork and raises on the parent,
    /// the root fails the run
    fn fail_cursor(&self, tx: &mut Transaction, cursor_id: Uuid, state_name: &str, error: ResourceError) {
        let join = tx.run.cursor(cursor_id).and_then(|c| c.join);
        let Some(slot) = join else {
            self.fail_run(tx, &error, Some(state_name));
            return;
        };

        let parent_id = tx.run.join_groups.get(&slot.group_id).map(|group| group.parent);
        self.retire_group(tx, slot.group_id);

        let Some(parent_id) = parent_id else {
            self.fail_run(tx, &error, Some(state_name));
            return;
        };
        match self.cursor_state(&tx.run, parent_id) {
            Some(parent_state) => self.raise(tx, parent_id, parent_state, error),
            None => self.fail_run(tx, &error, Some(state_name)),
        }
    }

    /// Remove every cursor of a join group, including nested forks
    fn retire_group(&self, tx: &mut Transaction, group_id: Uuid) {
        let mut groups = vec![group_id];
        let mut retired = 0usize;
        while let Some(group_id) = groups.pop() {
            tx.run.join_groups.remove(&group_id);
            let mut nested = Vec::new();
            tx.run.cursors.retain(|cursor| {
                let member = cursor.join.is_some_and(|slot| slot.group_id == group_id);
                if member {
                    if let CursorStatus::AwaitingJoin { group_id } = cursor.status {
                        nested.push(group_id);
                    }
                }
                !member
            });
            retired += 1;
            groups.extend(nested);
        }
        tracing::debug!(run_id = %tx.run.id, groups = retired, "retired fork");
    }

    /// Terminate the run as failed
    pub fn fail_run(&self, tx: &mut Transaction, error: &ResourceError, state: Option<&str>) {
        if tx.run.is_terminal() {
            return;
        }
        tx.run.status = RunStatus::Failed;
        tx.run.failure = Some(RunFailure {
            error: error.error.clone(),
            cause: error.cause.clone(),
            state: state.map(str::to_string),
        });
        tx.run.completed_at = Some(tx.now);
        tx.run.cursors.clear();
        tx.run.join_groups.clear();
        tx.audit(
            state,
            AuditAction::RunFailed,
            ACTOR_ENGINE,
            json!({ "error": error.error, "cause": error.cause }),
        );
        tracing::warn!(run_id = %tx.run.id, error = %error.error, cause = %error.cause, "run failed");
    }

    /// Cancel the run, retiring every cursor
    pub fn cancel(&self, tx: &mut Transaction, actor: &str, reason: Option<&str>) {
        if tx.run.is_terminal() {
            return;
        }
        let retired = tx.run.cursors.len();
        tx.run.status = RunStatus::Cancelled;
        tx.run.completed_at = Some(tx.now);
        tx.run.cursors.clear();
        tx.run.join_groups.clear();
        tx.audit(
            None,
            AuditAction::RunCancelled,
            actor,
            json!({ "reason": reason, "cursors_retired": retired }),
        );
    }

    /// Fail the run when it outlived the definition's `TimeoutSeconds`
    pub fn check_timeout(&self, tx: &mut Transaction) -> bool {
        let Some(timeout) = self.definition.timeout_seconds else {
            return false;
        };
        let expired = checked_offset(tx.run.created_at, timeout as f64)
            .map_or(false, |limit| tx.now >= limit);
        if tx.run.is_terminal() || !expired {
            return false;
        }
        let state = tx.run.current_state().map(str::to_string);
        self.fail_run(
            tx,
            &ResourceError::timeout(format!("run exceeded TimeoutSeconds={}", timeout)),
            state.as_deref(),
        );
        true
    }

    /// Resume cursors parked on `event_type` with `payload` as their Task result
    pub fn deliver_event(&self, tx: &mut Transaction, event_type: &str, payload: &Value) -> usize {
        let targets: Vec<Uuid> = tx
            .run
            .cursors
            .iter()
            .filter(|c| {
                matches!(&c.status, CursorStatus::AwaitingEvent { event_type: awaited } if awaited == event_type)
            })
            .map(|c| c.id)
            .collect();

        for cursor_id in &targets {
            let state_name = tx.run.cursor(*cursor_id).map(|c| c.state.clone());
            if let Some(cursor) = tx.run.cursor_mut(*cursor_id) {
                cursor.status = CursorStatus::Ready;
            }
            tx.audit(
                state_name.as_deref(),
                AuditAction::EventDelivered,
                ACTOR_ENGINE,
                json!({ "event_type": event_type }),
            );
            self.apply_task_outcome(tx, *cursor_id, Ok(payload.clone()));
        }
        targets.len()
    }

    /// Approval granted: the state's action runs on the next step
    pub fn grant_approval(&self, tx: &mut Transaction, cursor_id: Uuid) {
        if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
            cursor.approval_granted = true;
            cursor.status = CursorStatus::Ready;
        }
    }

    /// Rejection under `continue`: skip the action, keep the data, follow the transition
    pub fn skip_state(&self, tx: &mut Transaction, cursor_id: Uuid) {
        let Some(state) = self.cursor_state(&tx.run, cursor_id) else {
            return;
        };
        let Some(data) = tx.run.cursor(cursor_id).map(|c| c.data.clone()) else {
            return;
        };
        self.transition(tx, cursor_id, state, data);
    }

    /// Rejection under `alternate_path`
    pub fn redirect(&self, tx: &mut Transaction, cursor_id: Uuid, target: &str) {
        let now = tx.now;
        if let Some(cursor) = tx.run.cursor_mut(cursor_id) {
            let data = cursor.data.clone();
            cursor.enter(target, data, now);
        }
    }

    /// Rejection under `terminate`
    pub fn terminate_rejected(&self, tx: &mut Transaction, state: &str, actor: &str) {
        self.fail_run(
            tx,
            &ResourceError::new(ERROR_APPROVAL_REJECTED, format!("rejected by {}", actor)),
            Some(state),
        );
    }

    pub fn definition(&self) -> &'a Definition {
        self.definition
    }
}

fn map_child(
    graph: &GraphPath,
    start_at: &str,
    group_id: Uuid,
    index: usize,
    value: Value,
    now: DateTime<Utc>,
) -> Cursor {
    let mut child = Cursor::new(
        graph.clone(),
        start_at,
        json!({ "item": value, "index": index }),
        now,
    );
    child.join = Some(JoinSlot {
        group_id,
        slot: index,
    });
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::clock::ManualClock;
    use crate::workflow::parser::parse_definition;
    use crate::workflow::resource::handler_fn;
    use chrono::Duration;

    fn run_for(definition: &Definition, data: Value, now: DateTime<Utc>) -> Transaction {
        let run = Run::new(&definition.name, 1, data, "tester".to_string(), now, now + Duration::days(1));
        Transaction::create(run, now)
    }

    #[tokio::test]
    async fn test_pass_chain_completes() {
        let definition = parse_definition(
            "chain",
            r#"{
                "StartAt": "A",
                "States": {
                    "A": {"Type": "Pass", "Result": {"x": 1}, "ResultPath": "$.a", "Next": "B"},
                    "B": {"Type": "Pass", "Parameters": {"copy.$": "$.a.x"}, "ResultPath": "$.b", "End": true}
                }
            }"#,
        )
        .unwrap();
        let clock = ManualClock::new(Utc::now());
        let registry = ResourceRegistry::new();
        let interpreter = Interpreter::new(&definition, &registry, &clock, 600.0);

        let mut tx = run_for(&definition, json!({"seed": true}), clock.now());
        interpreter.start(&mut tx);
        interpreter.advance(&mut tx).await;

        assert_eq!(tx.run.status, RunStatus::Completed);
        assert_eq!(tx.run.data, json!({"seed": true, "a": {"x": 1}, "b": {"copy": 1}}));
        assert_eq!(tx.run.sla_status, SlaStatus::Completed);
        assert!(tx.audited().any(|a| a == AuditAction::RunCompleted));
    }

    #[tokio::test]
    async fn test_unhandled_error_fails_run() {
        let definition = parse_definition(
            "failing",
            r#"{"StartAt": "Call", "States": {"Call": {"Type": "Task", "Resource": "boom", "End": true}}}"#,
        )
        .unwrap();
        let clock = ManualClock::new(Utc::now());
        let registry = ResourceRegistry::new();
        registry.register(
            "boom",
            handler_fn(|_| async { Err(ResourceError::new("Custom.Error", "nope")) }),
        );
        let interpreter = Interpreter::new(&definition, &registry, &clock, 600.0);

        let mut tx = run_for(&definition, json!({}), clock.now());
        interpreter.start(&mut tx);
        interpreter.advance(&mut tx).await;

        assert_eq!(tx.run.status, RunStatus::Failed);
        let failure = tx.run.failure.clone().unwrap();
        assert_eq!(failure.error, "Custom.Error");
        assert_eq!(failure.state.as_deref(), Some("Call"));
        assert!(tx.audited().any(|a| a == AuditAction::StepFailureUnhandled));
    }

    #[tokio::test]
    async fn test_catch_merges_error_at_result_path() {
        let definition = parse_definition(
            "caught",
            r#"{
                "StartAt": "Call",
                "States": {
                    "Call": {
                        "Type": "Task", "Resource": "boom", "Next": "Done",
                        "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Recover", "ResultPath": "$.error"}]
                    },
                    "Recover": {"Type": "Succeed"},
                    "Done": {"Type": "Succeed"}
                }
            }"#,
        )
        .unwrap();
        let clock = ManualClock::new(Utc::now());
        let registry = ResourceRegistry::new();
        registry.register("boom", handler_fn(|_| async { Err(ResourceError::task_failed("down")) }));
        let interpreter = Interpreter::new(&definition, &registry, &clock, 600.0);

        let mut tx = run_for(&definition, json!({"order": 1}), clock.now());
        interpreter.start(&mut tx);
        interpreter.advance(&mut tx).await;

        assert_eq!(tx.run.status, RunStatus::Completed);
        assert_eq!(
            tx.run.data,
            json!({"order": 1, "error": {"Error": "States.TaskFailed", "Cause": "down"}})
        );
    }

    #[tokio::test]
    async fn test_wait_suspends_until_due() {
        let definition = parse_definition(
            "waiting",
            r#"{"StartAt": "Pause", "States": {
                "Pause": {"Type": "Wait", "SecondsPath": "$.delay", "Next": "Done"},
                "Done": {"Type": "Succeed"}
            }}"#,
        )
        .unwrap();
        let clock = ManualClock::new(Utc::now());
        let registry = ResourceRegistry::new();
        let interpreter = Interpreter::new(&definition, &registry, &clock, 600.0);

        let mut tx = run_for(&definition, json!({"delay": 30}), clock.now());
        interpreter.start(&mut tx);
        interpreter.advance(&mut tx).await;
        assert_eq!(tx.run.status, RunStatus::Running);
        assert!(tx.run.next_resume_at().is_some());

        clock.advance_seconds(29);
        interpreter.advance(&mut tx).await;
        assert_eq!(tx.run.status, RunStatus::Running);

        clock.advance_seconds(1);
        interpreter.advance(&mut tx).await;
        assert_eq!(tx.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_map_over_empty_array_yields_empty_results() {
        let definition = parse_definition(
            "empty-map",
            r#"{"StartAt": "Each", "States": {
                "Each": {
                    "Type": "Map", "ItemsPath": "$.items", "ResultPath": "$.results", "End": true,
                    "Iterator": {"StartAt": "Echo", "States": {"Echo": {"Type": "Pass", "End": true}}}
                }
            }}"#,
        )
        .unwrap();
        let clock = ManualClock::new(Utc::now());
        let registry = ResourceRegistry::new();
        let interpreter = Interpreter::new(&definition, &registry, &clock, 600.0);

        let mut tx = run_for(&definition, json!({"items": []}), clock.now());
        interpreter.start(&mut tx);
        interpreter.advance(&mut tx).await;

        assert_eq!(tx.run.status, RunStatus::Completed);
        assert_eq!(tx.run.data["results"], json!([]));
    }

    #[tokio::test]
    async fn test_failing_branch_raises_on_parallel_state() {
        let definition = parse_definition(
            "fan",
            r#"{"StartAt": "Fan", "States": {
                "Fan": {
                    "Type": "Parallel", "Next": "Done",
                    "Branches": [
                        {"StartAt": "Ok", "States": {"Ok": {"Type": "Pass", "End": true}}},
                        {"StartAt": "Bad", "States": {"Bad": {"Type": "Fail", "Error": "Branch.Broken", "Cause": "x"}}}
                    ],
                    "Catch": [{"ErrorEquals": ["Branch.Broken"], "Next": "Handled"}]
                },
                "Handled": {"Type": "Pass", "Result": "handled", "End": true},
                "Done": {"Type": "Succeed"}
            }}"#,
        )
        .unwrap();
        let clock = ManualClock::new(Utc::now());
        let registry = ResourceRegistry::new();
        let interpreter = Interpreter::new(&definition, &registry, &clock, 600.0);

        let mut tx = run_for(&definition, json!({}), clock.now());
        interpreter.start(&mut tx);
        interpreter.advance(&mut tx).await;

        assert_eq!(tx.run.status, RunStatus::Completed);
        assert_eq!(tx.run.data, json!("handled"));
        assert!(tx.run.join_groups.is_empty());
        assert!(!tx.audited().any(|a| a == AuditAction::JoinReleased));
    }

    #[test]
    fn test_approval_key_qualifies_nested_cursors() {
        let now = Utc::now();
        let mut run = Run::new("flow", 1, json!({}), "tester".to_string(), now, now);
        let root = Cursor::new(GraphPath::root(), "Approve", json!({}), now);
        assert_eq!(approval_key(&run, &root), "Approve");

        let group = JoinGroup::new(root.id, JoinKind::Map, 3, 0);
        let group_id = group.id;
        run.join_groups.insert(group_id, group);
        let graph = GraphPath::root().iterator("Each");
        let child = map_child(&graph, "Review", group_id, 2, json!(1), now);
        assert_eq!(approval_key(&run, &child), "$/Each[*]#2/Review");
    }
}
