//! # Flowgate Core Library
//!
//! Definition model, interpreter, human-task and SLA subsystems, run store and
//! the HTTP decision API for flowgate state machines.

pub mod models;
pub mod server;
pub mod services;
pub mod workflow;
