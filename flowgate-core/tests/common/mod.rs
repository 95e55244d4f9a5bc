//! Shared setup for workflow integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use flowgate_core::models::{AuditAction, AuditEntry, Configuration};
use flowgate_core::workflow::{JsonFileStore, ManualClock, ResourceRegistry, WorkflowOrchestrator};
use std::sync::Arc;

pub struct Harness {
    pub orchestrator: WorkflowOrchestrator,
    pub clock: Arc<ManualClock>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Orchestrator on an in-memory store and a manual clock
pub fn harness(resources: ResourceRegistry) -> Harness {
    harness_with_config(resources, Configuration::default())
}

pub fn harness_with_config(resources: ResourceRegistry, config: Configuration) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let orchestrator = WorkflowOrchestrator::with_clock(
        Arc::new(JsonFileStore::in_memory()),
        Arc::new(resources),
        config,
        clock.clone(),
    );
    Harness { orchestrator, clock }
}

pub fn actions(entries: &[AuditEntry]) -> Vec<AuditAction> {
    entries.iter().map(|entry| entry.action).collect()
}

pub fn count(entries: &[AuditEntry], action: AuditAction) -> usize {
    entries.iter().filter(|entry| entry.action == action).count()
}
