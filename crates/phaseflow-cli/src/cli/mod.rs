//! CLI command definitions for the `phaseflow` binary.
//!
//! Uses clap derive macros for argument parsing. Each subcommand lives in its
//! own module and receives the shared [`AppState`](crate::state::AppState).

pub mod output;
pub mod resolve;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use phaseflow_types::artifact::ArtifactKind;

/// Run multi-phase, agent-delegated workflows.
#[derive(Parser)]
#[command(name = "phaseflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Project root holding `phaseflow.toml` (defaults to the current directory).
    #[arg(long, global = true, env = "PHASEFLOW_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow and show its phases.
    Validate {
        /// Workflow name or path to a definition file.
        workflow: String,
    },

    /// Show which file a name resolves to, and from which tier.
    Resolve {
        kind: KindArg,
        name: String,
    },

    /// Run a workflow from its first phase.
    Run {
        /// Workflow name or path to a definition file.
        workflow: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Resume a paused run from a checkpoint file.
    Resume {
        /// Workflow name or path to a definition file.
        workflow: String,

        /// Checkpoint file (defaults to the newest saved for this workflow).
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Phase to restart at (defaults to the phase the run paused at).
        #[arg(long = "from")]
        from_phase: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Options shared by `run` and `resume`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Spec document exposed to prompts as `{{ spec.* }}`.
    #[arg(long)]
    pub spec: Option<PathBuf>,

    /// Skip the agent step with this name (repeatable).
    #[arg(long = "skip-step")]
    pub skip_steps: Vec<String>,

    /// Skip agent steps named like reviews or checks.
    #[arg(long)]
    pub skip_checks: bool,

    /// Working directory handed to every task.
    #[arg(long)]
    pub worktree: Option<PathBuf>,

    /// Branch name exposed to prompts as `{{ branch }}`.
    #[arg(long)]
    pub branch: Option<String>,
}

/// Artifact kind accepted by `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Workflow,
    Agent,
    Prompt,
}

impl From<KindArg> for ArtifactKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Workflow => ArtifactKind::Workflow,
            KindArg::Agent => ArtifactKind::Agent,
            KindArg::Prompt => ArtifactKind::Prompt,
        }
    }
}
