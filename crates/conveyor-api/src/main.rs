//! Conveyor operator CLI entry point.
//!
//! Binary name: `conveyor`
//!
//! Parses CLI arguments, installs tracing, wires the application state and
//! dispatches to the command handlers.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use conveyor_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::definition::DefinitionCommand;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut options = TracingOptions::with_verbosity(cli.verbose);
    options.otel = cli.otel;
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        // Neither needs the database.
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "conveyor", &mut std::io::stdout());
            Ok(())
        }
        Commands::Definition {
            action: DefinitionCommand::Lint { file },
        } => cli::definition::lint(&file, cli.json),

        Commands::Definition { action } => {
            let state = AppState::init().await?;
            cli::definition::handle_definition_command(action, &state, cli.json).await
        }
        Commands::Task { action } => {
            let state = AppState::init().await?;
            cli::task::handle_task_command(action, &state, cli.json).await
        }
    }
}
