//! phaseflow CLI entry point.
//!
//! Binary name: `phaseflow`
//!
//! Parses CLI arguments, sets up tracing, loads the project configuration,
//! then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use phaseflow_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};

use cli::run::OutputMode;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(verbosity_filter(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need project state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "phaseflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.root.clone()).await?;
    let mode = OutputMode {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Validate { workflow } => {
            cli::validate::handle_validate(&state, &workflow, cli.json)?;
        }
        Commands::Resolve { kind, name } => {
            cli::resolve::handle_resolve(&state, kind.into(), &name, cli.json)?;
        }
        Commands::Run { workflow, run } => {
            cli::run::handle_run(&state, &workflow, &run, mode).await?;
        }
        Commands::Resume {
            workflow,
            checkpoint,
            from_phase,
            run,
        } => {
            cli::run::handle_resume(
                &state,
                &workflow,
                checkpoint.as_deref(),
                from_phase.as_deref(),
                &run,
                mode,
            )
            .await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
