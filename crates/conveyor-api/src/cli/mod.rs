//! CLI command definitions for the `conveyor` binary.
//!
//! Uses clap derive macros. Commands follow a noun-verb pattern
//! (`conveyor definition import`, `conveyor task show`).

pub mod definition;
pub mod task;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use conveyor_types::status::Status;

/// Inspect and manage workflow tasks.
#[derive(Parser)]
#[command(name = "conveyor", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, hide = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions.
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Inspect stored tasks.
    Task {
        #[command(subcommand)]
        action: task::TaskCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Status rendered as a colored table cell.
pub(crate) fn status_cell(status: Status) -> Cell {
    let color = match status {
        Status::Passed => Color::Green,
        Status::Failed | Status::Timeout | Status::Reject => Color::Red,
        Status::Cancelled => Color::Yellow,
        Status::Running | Status::Prepare => Color::Cyan,
        Status::DebugBefore | Status::DebugAfter | Status::Pending => Color::Magenta,
        Status::Created => Color::Reset,
    };
    Cell::new(status.as_str()).fg(color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_task_list_filters() {
        let cli = Cli::try_parse_from([
            "conveyor",
            "task",
            "list",
            "--workflow",
            "release",
            "--status",
            "failed",
            "--status",
            "timeout",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Task {
                action: task::TaskCommand::List { workflow, statuses, .. },
            } => {
                assert_eq!(workflow.as_deref(), Some("release"));
                assert_eq!(statuses, vec![Status::Failed, Status::Timeout]);
            }
            _ => panic!("expected task list"),
        }
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(Cli::try_parse_from(["conveyor", "task", "list", "--status", "exploded"]).is_err());
    }
}
