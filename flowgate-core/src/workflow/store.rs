//! Run store: the engine's read/write contract and a JSON file implementation

use crate::models::definition::Definition;
use crate::models::workflow::{
    ApprovalStatus, ApprovalTask, AuditEntry, Escalation, Run,
};
use crate::workflow::document::DefinitionDocument;
use crate::workflow::error::{StoreError, ValidationError};
use crate::workflow::parser;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A published definition version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionRecord {
    pub name: String,
    pub version: u32,
    pub document: DefinitionDocument,
    pub published_at: DateTime<Utc>,
}

impl DefinitionRecord {
    /// Rebuild the validated definition model
    pub fn definition(&self) -> Result<Definition, ValidationError> {
        let mut definition = parser::from_document(&self.name, &self.document)?;
        definition.version = self.version;
        Ok(definition)
    }
}

/// One mutation inside an atomic batch
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Insert a new run; conflicts if the id exists
    CreateRun(Run),
    /// Replace a run snapshot (cursors, data, status)
    SaveRun(Run),
    /// Insert a pending task; conflicts if any task is already pending for (run, state)
    CreateApproval(ApprovalTask),
    /// Record a decision; conflicts unless the task is pending
    ResolveApproval {
        task_id: Uuid,
        status: ApprovalStatus,
        actor: String,
        comment: Option<String>,
        at: DateTime<Utc>,
    },
    /// Replace a task (role reassignment)
    UpdateApproval(ApprovalTask),
    CreateEscalation(Escalation),
    UpdateEscalation(Escalation),
    /// Append an audit entry; the store assigns its sequence number
    AppendAudit(AuditEntry),
}

/// Persistent store contract used by the engine.
///
/// `commit` is the only write primitive: a batch is applied completely or not at all.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Apply a batch atomically
    async fn commit(&self, batch: Vec<StoreOp>) -> StoreResult<()>;

    /// Store a new definition version; returns the assigned version
    async fn publish_definition(
        &self,
        name: &str,
        document: DefinitionDocument,
        at: DateTime<Utc>,
    ) -> StoreResult<u32>;

    /// Load a definition version (`None` = latest)
    async fn load_definition(&self, name: &str, version: Option<u32>) -> StoreResult<DefinitionRecord>;

    /// Latest version of every definition
    async fn list_definitions(&self) -> StoreResult<Vec<DefinitionRecord>>;

    async fn load_run(&self, run_id: Uuid) -> StoreResult<Run>;

    async fn list_runs(&self) -> StoreResult<Vec<Run>>;

    /// Runs the SLA monitor and the scheduler still care about
    async fn list_non_terminal_runs(&self) -> StoreResult<Vec<Run>>;

    /// Approval tasks, optionally restricted to one run
    async fn approval_tasks(&self, run_id: Option<Uuid>) -> StoreResult<Vec<ApprovalTask>>;

    async fn escalations(&self, run_id: Option<Uuid>) -> StoreResult<Vec<Escalation>>;

    /// Audit entries of a run in sequence order
    async fn audit_entries(&self, run_id: Uuid) -> StoreResult<Vec<AuditEntry>>;

    async fn create_run(&self, run: Run) -> StoreResult<Uuid> {
        let run_id = run.id;
        self.commit(vec![StoreOp::CreateRun(run)]).await?;
        Ok(run_id)
    }

    async fn save_run_cursor(&self, run: Run) -> StoreResult<()> {
        self.commit(vec![StoreOp::SaveRun(run)]).await
    }

    async fn create_approval_task(&self, task: ApprovalTask) -> StoreResult<()> {
        self.commit(vec![StoreOp::CreateApproval(task)]).await
    }

    async fn resolve_approval_task(
        &self,
        task_id: Uuid,
        status: ApprovalStatus,
        actor: &str,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.commit(vec![StoreOp::ResolveApproval {
            task_id,
            status,
            actor: actor.to_string(),
            comment,
            at,
        }])
        .await
    }

    async fn append_audit_entry(&self, entry: AuditEntry) -> StoreResult<()> {
        self.commit(vec![StoreOp::AppendAudit(entry)]).await
    }
}

/// Root JSON document holding all store data
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JsonStore {
    /// Every published definition version
    #[serde(default)]
    pub definitions: Vec<DefinitionRecord>,
    /// All runs
    #[serde(default)]
    pub runs: Vec<Run>,
    /// All approval tasks
    #[serde(default)]
    pub approvals: Vec<ApprovalTask>,
    /// All escalation records
    #[serde(default)]
    pub escalations: Vec<Escalation>,
    /// Append-only audit log
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
    /// Last assigned audit sequence number
    #[serde(default)]
    pub last_sequence: u64,
}

impl JsonStore {
    fn apply(&mut self, op: StoreOp) -> StoreResult<()> {
        match op {
            StoreOp::CreateRun(run) => {
                if self.runs.iter().any(|r| r.id == run.id) {
                    return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
                }
                self.runs.push(run);
            }
            StoreOp::SaveRun(run) => {
                let existing = self
                    .runs
                    .iter_mut()
                    .find(|r| r.id == run.id)
                    .ok_or_else(|| StoreError::NotFound(format!("run {}", run.id)))?;
                *existing = run;
            }
            StoreOp::CreateApproval(task) => {
                if self.approvals.iter().any(|t| {
                    t.run_id == task.run_id && t.state_id == task.state_id && t.is_pending()
                }) {
                    return Err(StoreError::Conflict(format!(
                        "a pending approval task already exists for state '{}' of run {}",
                        task.state_id, task.run_id
                    )));
                }
                self.approvals.push(task);
            }
            StoreOp::ResolveApproval {
                task_id,
                status,
                actor,
                comment,
                at,
            } => {
                let task = self
                    .approvals
                    .iter_mut()
                    .find(|t| t.id == task_id)
                    .ok_or_else(|| StoreError::NotFound(format!("approval task {}", task_id)))?;
                if !task.is_pending() {
                    return Err(StoreError::Conflict(format!(
                        "approval task {} was already decided",
                        task_id
                    )));
                }
                task.status = status;
                task.decided_by = Some(actor);
                task.comment = comment;
                task.decided_at = Some(at);
            }
            StoreOp::UpdateApproval(task) => {
                let existing = self
                    .approvals
                    .iter_mut()
                    .find(|t| t.id == task.id)
                    .ok_or_else(|| StoreError::NotFound(format!("approval task {}", task.id)))?;
                *existing = task;
            }
            StoreOp::CreateEscalation(escalation) => self.escalations.push(escalation),
            StoreOp::UpdateEscalation(escalation) => {
                let existing = self
                    .escalations
                    .iter_mut()
                    .find(|e| e.id == escalation.id)
                    .ok_or_else(|| StoreError::NotFound(format!("escalation {}", escalation.id)))?;
                *existing = escalation;
            }
            StoreOp::AppendAudit(mut entry) => {
                self.last_sequence += 1;
                entry.sequence = self.last_sequence;
                self.audit.push(entry);
            }
        }
        Ok(())
    }
}

/// JSON file store; `None` path keeps everything in memory
pub struct JsonFileStore {
    /// Path to JSON store file
    store_path: Option<PathBuf>,
    /// In-memory copy of the store
    store: Mutex<JsonStore>,
}

impl JsonFileStore {
    /// Open (or create) a store file
    pub fn open<P: AsRef<Path>>(store_path: P) -> anyhow::Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let store = if store_path.exists() {
            Self::load_store(&store_path)?
        } else {
            JsonStore::default()
        };

        Ok(Self {
            store_path: Some(store_path),
            store: Mutex::new(store),
        })
    }

    /// Store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            store_path: None,
            store: Mutex::new(JsonStore::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    /// Load the store file under a shared lock
    fn load_store(path: &Path) -> anyhow::Result<JsonStore> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(Self::lock_path(path))
            .context("Failed to open store lock file")?;
        lock.lock_shared()
            .context("Failed to acquire read lock on store")?;

        let mut contents = String::new();
        File::open(path)
            .context("Failed to open store file")?
            .read_to_string(&mut contents)
            .context("Failed to read store file")?;

        if contents.trim().is_empty() {
            return Ok(JsonStore::default());
        }

        serde_json::from_str(&contents).context("Failed to parse store JSON")
    }

    /// Write the store via temp file + rename under an exclusive lock
    fn save_store(path: &Path, store: &JsonStore) -> anyhow::Result<()> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(Self::lock_path(path))
            .context("Failed to open store lock file")?;
        lock.lock_exclusive()
            .context("Failed to acquire write lock on store")?;

        let json = serde_json::to_string_pretty(store).context("Failed to serialize store")?;

        let temp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path).context("Failed to create temporary store file")?;
            file.write_all(json.as_bytes())
                .context("Failed to write store")?;
            file.sync_all().context("Failed to flush store to disk")?;
        }
        std::fs::rename(&temp_path, path).context("Failed to replace store file")?;

        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, JsonStore>> {
        self.store
            .lock()
            .map_err(|_| StoreError::Io(anyhow::anyhow!("store mutex poisoned")))
    }
}

#[async_trait]
impl RunStore for JsonFileStore {
    async fn commit(&self, batch: Vec<StoreOp>) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut store = self.lock()?;

        let mut staged = store.clone();
        for op in batch {
            staged.apply(op)?;
        }

        if let Some(path) = &self.store_path {
            Self::save_store(path, &staged).map_err(StoreError::Io)?;
        }
        *store = staged;
        Ok(())
    }

    async fn publish_definition(
        &self,
        name: &str,
        document: DefinitionDocument,
        at: DateTime<Utc>,
    ) -> StoreResult<u32> {
        let mut store = self.lock()?;
        let version = store
            .definitions
            .iter()
            .filter(|d| d.name == name)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1;

        let mut staged = store.clone();
        staged.definitions.push(DefinitionRecord {
            name: name.to_string(),
            version,
            document,
            published_at: at,
        });
        if let Some(path) = &self.store_path {
            Self::save_store(path, &staged).map_err(StoreError::Io)?;
        }
        *store = staged;
        Ok(version)
    }

    async fn load_definition(&self, name: &str, version: Option<u32>) -> StoreResult<DefinitionRecord> {
        let store = self.lock()?;
        store
            .definitions
            .iter()
            .filter(|d| d.name == name && version.map_or(true, |v| d.version == v))
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or_else(|| match version {
                Some(v) => StoreError::NotFound(format!("definition '{}' version {}", name, v)),
                None => StoreError::NotFound(format!("definition '{}'", name)),
            })
    }

    async fn list_definitions(&self) -> StoreResult<Vec<DefinitionRecord>> {
        let store = self.lock()?;
        let mut latest: Vec<DefinitionRecord> = Vec::new();
        for record in &store.definitions {
            match latest.iter_mut().find(|d| d.name == record.name) {
                Some(existing) if existing.version < record.version => *existing = record.clone(),
                Some(_) => {}
                None => latest.push(record.clone()),
            }
        }
        latest.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(latest)
    }

    async fn load_run(&self, run_id: Uuid) -> StoreResult<Run> {
        let store = self.lock()?;
        store
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))
    }

    async fn list_runs(&self) -> StoreResult<Vec<Run>> {
        Ok(self.lock()?.runs.clone())
    }

    async fn list_non_terminal_runs(&self) -> StoreResult<Vec<Run>> {
        let store = self.lock()?;
        Ok(store
            .runs
            .iter()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    async fn approval_tasks(&self, run_id: Option<Uuid>) -> StoreResult<Vec<ApprovalTask>> {
        let store = self.lock()?;
        Ok(store
            .approvals
            .iter()
            .filter(|t| run_id.map_or(true, |id| t.run_id == id))
            .cloned()
            .collect())
    }

    async fn escalations(&self, run_id: Option<Uuid>) -> StoreResult<Vec<Escalation>> {
        let store = self.lock()?;
        Ok(store
            .escalations
            .iter()
            .filter(|e| run_id.map_or(true, |id| e.run_id == id))
            .cloned()
            .collect())
    }

    async fn audit_entries(&self, run_id: Uuid) -> StoreResult<Vec<AuditEntry>> {
        let store = self.lock()?;
        let mut entries: Vec<AuditEntry> = store
            .audit
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}
