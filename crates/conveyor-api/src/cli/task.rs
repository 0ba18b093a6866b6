//! CLI task subcommands: list, show, args and recover.

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;

use conveyor_core::controller::ControllerError;
use conveyor_core::repository::task::TaskRepository;
use conveyor_core::workflow::definition::serialize_definition_yaml;
use conveyor_types::status::Status;
use conveyor_types::task::{Task, TaskFilter, TaskKey};

use super::status_cell;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum TaskCommand {
    /// List tasks, newest first.
    #[command(alias = "ls")]
    List {
        /// Only tasks of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Only tasks of this project.
        #[arg(long)]
        project: Option<String>,

        /// Only tasks in these statuses (repeatable).
        #[arg(long = "status")]
        statuses: Vec<Status>,

        /// Only tasks created by these users (repeatable).
        #[arg(long = "creator")]
        creators: Vec<String>,

        #[arg(long, default_value = "20")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show a task with its stages and jobs.
    Show {
        workflow: String,
        task_id: i64,
    },

    /// Print the arguments a task was created with, as YAML.
    Args {
        workflow: String,
        task_id: i64,
    },

    /// Mark tasks left unfinished by a stopped engine as failed so they can
    /// be retried.
    Recover {
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },
}

pub async fn handle_task_command(cmd: TaskCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        TaskCommand::List {
            workflow,
            project,
            statuses,
            creators,
            limit,
            offset,
        } => {
            let filter = TaskFilter {
                workflow_name: workflow,
                project,
                creators,
                statuses,
                limit,
                offset,
            };
            list(&filter, state, json).await
        }
        TaskCommand::Show { workflow, task_id } => {
            show(&TaskKey::new(workflow, task_id), state, json).await
        }
        TaskCommand::Args { workflow, task_id } => {
            args(&TaskKey::new(workflow, task_id), state, json).await
        }
        TaskCommand::Recover { yes } => recover(yes, state, json).await,
    }
}

async fn load(key: &TaskKey, state: &AppState) -> Result<Task> {
    state.controller.snapshot(key).await.map_err(|e| match e {
        ControllerError::NotFound(key) => anyhow!("Task {key} not found"),
        other => anyhow!("Failed to load task {key}: {other}"),
    })
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// `1h 02m`, `3m 07s`, `12s`; empty until the interval has started.
fn format_elapsed(started: Option<DateTime<Utc>>, ended: Option<DateTime<Utc>>) -> String {
    let Some(started) = started else {
        return String::new();
    };
    let secs = (ended.unwrap_or_else(Utc::now) - started).num_seconds().max(0);
    match secs {
        s if s >= 3600 => format!("{}h {:02}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m {:02}s", s / 60, s % 60),
        s => format!("{s}s"),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn list(filter: &TaskFilter, state: &AppState, json: bool) -> Result<()> {
    let (tasks, total) = state
        .controller
        .repository()
        .list_by_filter(filter)
        .await
        .map_err(|e| anyhow!("Failed to list tasks: {e}"))?;

    if json {
        let out = serde_json::json!({ "total": total, "tasks": tasks });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!();
        println!("  No tasks found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Project"),
            Cell::new("Status"),
            Cell::new("Creator"),
            Cell::new("Created"),
            Cell::new("Duration"),
        ]);

    for t in &tasks {
        let name = if t.is_restart {
            format!("{}#{} (retry)", t.workflow_name, t.task_id)
        } else {
            format!("{}#{}", t.workflow_name, t.task_id)
        };
        table.add_row(vec![
            Cell::new(name),
            Cell::new(&t.project),
            status_cell(t.status),
            Cell::new(&t.creator),
            Cell::new(format_time(Some(t.created_at))),
            Cell::new(format_elapsed(t.started_at, t.ended_at)),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  {}",
        style(format!(
            "Showing {}-{} of {total}",
            filter.offset as usize + 1,
            filter.offset as usize + tasks.len()
        ))
        .dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn show(key: &TaskKey, state: &AppState, json: bool) -> Result<()> {
    let task = load(key, state).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}  {}",
        style("Task").bold(),
        style(key.to_string()).cyan(),
        task.status
    );
    println!("  Creator: {}", task.creator);
    if let Some(revoker) = &task.revoker {
        println!("  Cancelled by: {revoker}");
    }
    println!("  Created: {}", format_time(Some(task.created_at)));
    if task.started_at.is_some() {
        println!(
            "  Ran: {} ({})",
            format_time(task.started_at),
            format_elapsed(task.started_at, task.ended_at)
        );
    }
    if task.debug {
        println!("  Debug mode: {}", style("on").magenta());
    }
    if let Some(error) = &task.error {
        println!("  Error: {}", style(error).red());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Job"),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for stage in &task.stages {
        let gate = stage
            .approval
            .as_ref()
            .filter(|a| a.enabled)
            .map(|a| {
                format!(
                    " [approval {}: {}/{}]",
                    a.status,
                    a.decisions.len(),
                    a.needed_approvers
                )
            })
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(format!("{}{gate}", stage.name)),
            Cell::new(if stage.parallel { "(parallel)" } else { "" }),
            Cell::new(""),
            status_cell(stage.status),
            Cell::new(format_elapsed(stage.started_at, stage.ended_at)),
            Cell::new(stage.error.as_deref().unwrap_or("")),
        ]);
        for job in &stage.jobs {
            let mut name = job.name.clone();
            if job.breakpoint_before {
                name.push_str(" [bp:before]");
            }
            if job.breakpoint_after {
                name.push_str(" [bp:after]");
            }
            table.add_row(vec![
                Cell::new(""),
                Cell::new(name),
                Cell::new(job.job_type().as_str()),
                status_cell(job.status),
                Cell::new(format_elapsed(job.started_at, job.ended_at)),
                Cell::new(job.error.as_deref().unwrap_or("")),
            ]);
        }
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Args
// ---------------------------------------------------------------------------

async fn args(key: &TaskKey, state: &AppState, json: bool) -> Result<()> {
    let task = load(key, state).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task.original_args)?);
    } else {
        print!("{}", serialize_definition_yaml(&task.original_args)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

async fn recover(yes: bool, state: &AppState, json: bool) -> Result<()> {
    let pending = state
        .controller
        .repository()
        .list_unfinished()
        .await
        .map_err(|e| anyhow!("Failed to list unfinished tasks: {e}"))?;

    if pending.is_empty() {
        if json {
            println!("{}", serde_json::json!({ "recovered": [] }));
        } else {
            println!();
            println!("  No unfinished tasks.");
            println!();
        }
        return Ok(());
    }

    if !yes && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Mark {} unfinished task(s) as failed? Only do this while no engine is running.",
                style(pending.len()).red().bold()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            bail!("Aborted");
        }
    }

    let recovered = state.controller.recover_interrupted().await?;

    if json {
        let keys: Vec<String> = recovered.iter().map(ToString::to_string).collect();
        println!("{}", serde_json::json!({ "recovered": keys }));
    } else {
        println!();
        for key in &recovered {
            println!("  {} {key} marked failed", style("*").yellow().bold());
        }
        println!();
        println!("  {} task(s) can now be retried.", recovered.len());
        println!();
    }
    Ok(())
}
