//! Shared domain types for phaseflow.
//!
//! Workflow definition tree, agent/prompt records, dispatch messages, audit
//! entries, checkpoints and run results.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono.

pub mod agent;
pub mod artifact;
pub mod audit;
pub mod config;
pub mod run;
pub mod workflow;
