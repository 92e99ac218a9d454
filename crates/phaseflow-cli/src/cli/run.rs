//! `phaseflow run` and `phaseflow resume`.
//!
//! The CLI dispatches through the dry-run executor: every phase is walked and
//! audited, prompts are composed and logged, and no agent backend is called.
//! A paused run saves its checkpoint under the configured checkpoint directory.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use phaseflow_core::workflow::audit::{AuditSink, NullAuditSink};
use phaseflow_core::workflow::executor::{RunOptions, WorkflowEngine};
use phaseflow_infra::checkpoint_store::{FileCheckpointStore, SavedCheckpoint};
use phaseflow_infra::dry_run::DryRunExecutor;
use phaseflow_types::run::{RunResult, RunStatus};
use phaseflow_types::workflow::WorkflowDefinition;
use tokio_util::sync::CancellationToken;

use super::RunArgs;
use super::output::{ConsoleAuditSink, result_table, styled_status};
use crate::state::AppState;

/// Output switches from the global flags.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub json: bool,
    pub quiet: bool,
}

fn run_options(args: &RunArgs, cancel: CancellationToken) -> RunOptions {
    RunOptions {
        skip_step_names: args.skip_steps.clone(),
        skip_checks: args.skip_checks,
        worktree: args.worktree.clone(),
        branch: args.branch.clone(),
        spec_path: args.spec.clone(),
        cancel: Some(cancel),
        ..Default::default()
    }
}

/// Cancel the run on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling run");
            child.cancel();
        }
    });
    token
}

fn build_engine(state: &AppState, args: &RunArgs, mode: OutputMode) -> WorkflowEngine {
    let sink: Arc<dyn AuditSink> = if mode.json || mode.quiet {
        Arc::new(NullAuditSink)
    } else {
        Arc::new(ConsoleAuditSink)
    };
    state
        .engine(Arc::new(DryRunExecutor::new()), run_options(args, cancel_on_ctrl_c()))
        .with_audit_sink(sink)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &str,
    args: &RunArgs,
    mode: OutputMode,
) -> Result<()> {
    let engine = build_engine(state, args, mode);
    let def = engine.load_workflow(workflow)?;

    if !mode.json && !mode.quiet {
        eprintln!();
        eprintln!(
            "  Running '{}' ({} phases, dry run)",
            style(&def.name).cyan(),
            def.phases.len()
        );
        eprintln!();
    }

    let result = engine.run_definition(def.clone(), args.spec.as_deref()).await?;
    report(state, &def, &result, mode).await
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(
    state: &AppState,
    workflow: &str,
    checkpoint: Option<&std::path::Path>,
    from_phase: Option<&str>,
    args: &RunArgs,
    mode: OutputMode,
) -> Result<()> {
    let engine = build_engine(state, args, mode);
    let def = engine.load_workflow(workflow)?;

    let path = match checkpoint {
        Some(path) => path.to_path_buf(),
        None => state
            .checkpoint_store()
            .latest(&def.name)
            .await?
            .with_context(|| {
                format!(
                    "no saved checkpoint for '{}' in {}; pass --checkpoint",
                    def.name,
                    state.layout.checkpoint_dir.display()
                )
            })?,
    };
    let loaded = FileCheckpointStore::load(&path).await?;
    let from_phase = from_phase.or(loaded.paused_at_phase());

    if !mode.json && !mode.quiet {
        eprintln!();
        eprintln!(
            "  Resuming '{}' from {} ({} phases already completed)",
            style(&def.name).cyan(),
            style(from_phase.unwrap_or("the first phase")).cyan(),
            loaded.checkpoint().completed_phases.len()
        );
        eprintln!();
    }

    let result = engine
        .resume_definition(def.clone(), loaded.checkpoint(), from_phase)
        .await?;
    report(state, &def, &result, mode).await
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

async fn report(
    state: &AppState,
    def: &WorkflowDefinition,
    result: &RunResult,
    mode: OutputMode,
) -> Result<()> {
    let saved_path = match SavedCheckpoint::from_result(result) {
        Some(saved) => Some(state.checkpoint_store().save(&saved).await?),
        None => None,
    };

    if mode.json {
        let mut out = serde_json::to_value(result)?;
        if let (Some(path), Some(obj)) = (&saved_path, out.as_object_mut()) {
            obj.insert("checkpointPath".to_string(), serde_json::json!(path));
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !mode.quiet {
        println!();
        println!("{}", result_table(def, result));
        println!();
        println!("  Status: {}", styled_status(result.status));
        println!("  Run ID: {}", result.run_id);
        if !result.changed_files.is_empty() {
            println!("  Changed files:");
            for file in &result.changed_files {
                println!("    {file}");
            }
        }
        if let Some(blocker) = &result.blocker_details {
            println!("  Blocker: {blocker}");
        }
        if let Some(path) = &saved_path {
            println!(
                "  Checkpoint: {}",
                style(path.display()).cyan()
            );
            println!(
                "  Resume with: phaseflow resume {} --checkpoint {}",
                def.name,
                path.display()
            );
        }
        println!();
    }

    if result.status == RunStatus::Failed {
        bail!(
            "workflow '{}' failed: {}",
            def.name,
            result.error.as_deref().unwrap_or("one or more phases failed")
        );
    }
    Ok(())
}
