//! Observability setup for phaseflow binaries.

pub mod tracing_setup;
