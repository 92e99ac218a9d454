//! Workflow engine core: definition validation, artifact resolution, prompt
//! composition, and phase-by-phase execution with pause/resume.
//!
//! - `definition` -- document validation into the typed step tree, YAML load/save
//! - `resolver` -- two-tier (project, then builtin) artifact lookup
//! - `loader` -- agent/prompt frontmatter parsing and dispatch composition
//! - `context` -- mutable run state, checkpoints, template rendering
//! - `condition` -- minimal condition language with falsy-on-missing evaluation
//! - `dispatch` -- task-executor seam and message-stream collection
//! - `handler` -- registry for `code` step handlers
//! - `audit` -- ordered audit stream and sinks
//! - `step_runner` -- the recursive per-kind step interpreter
//! - `executor` -- phase orchestration, safety limits, pause/resume

pub mod audit;
pub mod condition;
pub mod context;
pub mod definition;
pub mod dispatch;
pub mod executor;
pub mod handler;
pub mod loader;
pub mod resolver;
pub mod step_runner;
