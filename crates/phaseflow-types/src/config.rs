//! Engine configuration types.
//!
//! `EngineConfig` represents the optional `phaseflow.toml` in a project root.
//! Every field has a default so an absent or empty file is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a phaseflow project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Project-tier directory holding `workflows/`, `agents/` and `prompts/`.
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,

    /// Built-in tier directory. Falls back to `<data_dir>/builtin` when unset.
    #[serde(default)]
    pub builtin_dir: Option<PathBuf>,

    /// Working directory handed to every dispatched task.
    #[serde(default)]
    pub worktree: Option<PathBuf>,

    /// Per-step timeout used when a workflow declares no safety limit.
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,

    /// Where paused runs save their checkpoints.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".phaseflow")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".phaseflow/checkpoints")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_dir: default_project_dir(),
            builtin_dir: None,
            worktree: None,
            default_step_timeout_ms: None,
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}
