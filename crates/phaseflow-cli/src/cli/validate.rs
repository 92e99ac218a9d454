//! `phaseflow validate`: load a definition and show its phases.

use std::sync::Arc;

use anyhow::Result;
use console::style;
use phaseflow_core::workflow::executor::RunOptions;
use phaseflow_infra::dry_run::DryRunExecutor;

use super::output::definition_table;
use crate::state::AppState;

pub fn handle_validate(state: &AppState, workflow: &str, json: bool) -> Result<()> {
    let engine = state.engine(Arc::new(DryRunExecutor::new()), RunOptions::default());
    let def = engine.load_workflow(workflow)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' v{} is valid",
        style("✓").green().bold(),
        style(&def.name).cyan(),
        def.version
    );
    if let Some(agent) = &def.defaults.agent {
        println!("  Default agent: {agent}");
    }
    if let Some(safety) = &def.safety {
        if let Some(ms) = safety.max_workflow_duration_ms {
            println!("  Duration limit: {ms}ms");
        }
        if let Some(ms) = safety.max_step_timeout_ms {
            println!("  Step timeout: {ms}ms");
        }
        if !safety.fail_on_step_error {
            println!("  Continues past failing phases");
        }
    }
    println!();
    println!("{}", definition_table(&def));
    println!();
    Ok(())
}
