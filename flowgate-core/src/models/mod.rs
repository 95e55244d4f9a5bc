//! Data models for flowgate

pub mod configuration;
pub mod definition;
pub mod workflow;

pub use configuration::*;
pub use definition::*;
pub use workflow::*;
