//! CLI command handling

pub mod handlers;
pub mod workflow;
pub mod workflow_handlers;
