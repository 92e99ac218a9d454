//! Core interpreter for phaseflow.
//!
//! Everything that decides *what happens* during a workflow run lives here.
//! Filesystem layout conventions, config loading and concrete task executors
//! live in `phaseflow-infra`.

pub mod workflow;
