//! Run state: checkpoints and run results.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Position of the current task within a per-task iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCursor {
    pub id: String,
    pub index: usize,
    pub count: usize,
}

/// Serializable snapshot of an execution context.
///
/// Restoring a checkpoint reproduces the same variables, completed phases,
/// changed files and current task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Completed top-level phases in completion order.
    #[serde(default)]
    pub completed_phases: Vec<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running or resuming a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub completed_phases: Vec<String>,
    /// All context variables at the end of the run.
    pub outputs: HashMap<String, Value>,
    pub changed_files: Vec<String>,
    /// Phases that failed while `failOnStepError` was off.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_phases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Resume point, present when the run paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

impl RunResult {
    pub fn is_paused(&self) -> bool {
        self.status == RunStatus::Paused
    }
}
