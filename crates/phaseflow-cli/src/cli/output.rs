//! Styled terminal output shared by the commands.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use phaseflow_core::workflow::audit::{AuditError, AuditSink};
use phaseflow_types::audit::{AuditEntry, AuditStatus};
use phaseflow_types::run::{RunResult, RunStatus};
use phaseflow_types::workflow::{OnExhausted, Step, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Live audit stream
// ---------------------------------------------------------------------------

/// Prints one line per audit entry to stderr as the run progresses.
pub struct ConsoleAuditSink;

impl AuditSink for ConsoleAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let marker = match entry.status {
            AuditStatus::Started => style("▸").cyan(),
            AuditStatus::Completed => style("✓").green(),
            AuditStatus::Failed => style("✗").red(),
            AuditStatus::Skipped => style("-").dim(),
            AuditStatus::Paused => style("‖").yellow(),
        };
        let detail = match entry.status {
            AuditStatus::Skipped => entry.reason().map(str::to_string),
            AuditStatus::Failed => metadata_str(entry, "error"),
            AuditStatus::Paused => metadata_str(entry, "blocker"),
            AuditStatus::Completed => entry
                .metadata
                .as_ref()
                .and_then(|m| m.get("durationMs"))
                .and_then(serde_json::Value::as_u64)
                .map(|ms| format!("{ms}ms")),
            AuditStatus::Started => None,
        };
        match detail {
            Some(detail) => eprintln!("  {marker} {} {}", entry.step, style(detail).dim()),
            None => eprintln!("  {marker} {}", entry.step),
        }
        Ok(())
    }
}

fn metadata_str(entry: &AuditEntry, key: &str) -> Option<String> {
    entry
        .metadata
        .as_ref()
        .and_then(|m| m.get(key))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

fn new_table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// One-line summary of what a step does.
pub fn step_summary(step: &Step) -> String {
    match step {
        Step::Agent(s) => {
            let mut parts = Vec::new();
            if let Some(agent) = &s.agent {
                parts.push(format!("agent {agent}"));
            }
            if let Some(prompt) = &s.prompt {
                parts.push(format!("prompt {prompt}"));
            }
            if let Some(condition) = &s.condition {
                parts.push(format!("if {condition}"));
            }
            if !s.enabled {
                parts.push("disabled".to_string());
            }
            parts.join(", ")
        }
        Step::Code(s) => format!("handler {}", s.handler),
        Step::Parallel(s) => format!("{} concurrent steps", s.steps.len()),
        Step::Loop(s) => {
            let then = match s.on_exhausted {
                OnExhausted::Escalate => "escalate",
                OnExhausted::Warn => "warn",
                OnExhausted::Fail => "fail",
            };
            format!("while {} (max {}, then {then})", s.condition, s.max_retries)
        }
        Step::PerTask(s) => format!("for each task in {}", s.source),
    }
}

/// Phase table for a workflow definition.
pub fn definition_table(def: &WorkflowDefinition) -> Table {
    let mut table = new_table(vec![
        Cell::new("#"),
        Cell::new("Phase").fg(Color::Cyan),
        Cell::new("Type"),
        Cell::new("Details"),
    ]);
    for (i, phase) in def.phases.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(phase.name()),
            Cell::new(phase.kind()),
            Cell::new(step_summary(phase)),
        ]);
    }
    table
}

fn phase_status(result: &RunResult, phase: &str) -> Cell {
    if result.completed_phases.iter().any(|p| p == phase) {
        Cell::new("completed").fg(Color::Green)
    } else if result.failed_phases.iter().any(|p| p == phase) {
        Cell::new("failed").fg(Color::Red)
    } else if result.paused_at_phase.as_deref() == Some(phase) {
        Cell::new("paused").fg(Color::Yellow)
    } else {
        Cell::new("-").fg(Color::DarkGrey)
    }
}

/// Per-phase outcome table for a finished run.
pub fn result_table(def: &WorkflowDefinition, result: &RunResult) -> Table {
    let mut table = new_table(vec![
        Cell::new("Phase").fg(Color::Cyan),
        Cell::new("Type"),
        Cell::new("Status"),
        Cell::new("Output"),
    ]);
    for phase in &def.phases {
        let stored = phase
            .output_key()
            .filter(|key| result.outputs.contains_key(*key))
            .unwrap_or("-");
        table.add_row(vec![
            Cell::new(phase.name()),
            Cell::new(phase.kind()),
            phase_status(result, phase.name()),
            Cell::new(stored),
        ]);
    }
    table
}

pub fn styled_status(status: RunStatus) -> String {
    match status {
        RunStatus::Completed => style(status).green().bold().to_string(),
        RunStatus::Failed => style(status).red().bold().to_string(),
        RunStatus::Paused => style(status).yellow().bold().to_string(),
    }
}
