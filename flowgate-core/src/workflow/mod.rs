//! Workflow orchestration module

pub mod approvals;
pub mod audit;
pub mod clock;
pub mod command_handler;
pub mod condition;
pub mod document;
pub mod error;
pub mod http_handler;
pub mod interpreter;
pub mod loader;
pub mod orchestrator;
pub mod parser;
pub mod path;
pub mod resource;
pub mod sla;
pub mod store;
pub mod validator;

pub use approvals::{Resolution, ResolutionOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::*;
pub use interpreter::{Interpreter, Transaction};
pub use loader::load_definitions_from_dir;
pub use orchestrator::*;
pub use parser::{parse_definition, serialize_definition};
pub use resource::{handler_fn, ResourceHandler, ResourceRegistry};
pub use store::{JsonFileStore, RunStore, StoreOp};
pub use validator::*;
