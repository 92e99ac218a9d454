//! Infrastructure layer for phaseflow.
//!
//! Filesystem-facing collaborators of the engine in `phaseflow-core`: data
//! directory and project layout resolution, `phaseflow.toml` loading, the JSON
//! checkpoint store used for pause/resume, and a dry-run task executor.

pub mod checkpoint_store;
pub mod config;
pub mod dry_run;
pub mod filesystem;
