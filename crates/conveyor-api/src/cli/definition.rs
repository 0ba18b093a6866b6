//! CLI workflow definition subcommands: lint, import and list.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use conveyor_core::repository::definition::DefinitionStore;
use conveyor_core::workflow::definition::{DefinitionError, definition_hash, load_definition_file};
use conveyor_types::definition::WorkflowDefinition;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Parse and validate a definition file without storing it.
    Lint {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Validate a definition file and store it, replacing any previous
    /// definition with the same name.
    Import {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// List stored definitions.
    #[command(alias = "ls")]
    List,
}

/// Handle a definition subcommand that needs the database.
pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Lint { file } => lint(&file, json),
        DefinitionCommand::Import { file } => import(&file, state, json).await,
        DefinitionCommand::List => list(state, json).await,
    }
}

fn load(file: &Path) -> Result<WorkflowDefinition> {
    load_definition_file(file).map_err(|e| match e {
        DefinitionError::Parse(msg) => anyhow!("Failed to parse {}: {msg}", file.display()),
        DefinitionError::Validation(msg) => anyhow!("{} is invalid: {msg}", file.display()),
        DefinitionError::Io(err) => anyhow!("Failed to read {}: {err}", file.display()),
    })
}

fn job_count(def: &WorkflowDefinition) -> usize {
    def.stages.iter().map(|s| s.jobs.len()).sum()
}

fn summary_json(def: &WorkflowDefinition, hash: &str) -> serde_json::Value {
    serde_json::json!({
        "name": def.name,
        "project": def.project,
        "version": def.version,
        "stages": def.stages.len(),
        "jobs": job_count(def),
        "hash": hash,
    })
}

// ---------------------------------------------------------------------------
// Lint
// ---------------------------------------------------------------------------

/// Validate a file. Needs no application state.
pub fn lint(file: &Path, json: bool) -> Result<()> {
    let def = load(file)?;
    let hash = definition_hash(&def)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&def, &hash))?);
    } else {
        println!();
        println!(
            "  {} '{}' is valid: {} stages, {} jobs",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.stages.len(),
            job_count(&def)
        );
        println!("  Hash: {}", style(&hash[..12]).dim());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

async fn import(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load(file)?;
    let hash = definition_hash(&def)?;
    let replaced = state
        .definitions
        .find_definition(&def.name)
        .await?
        .is_some();

    state
        .definitions
        .save_definition(&def)
        .await
        .map_err(|e| anyhow!("Failed to save definition: {e}"))?;
    tracing::info!(workflow = def.name.as_str(), replaced, "definition imported");

    if json {
        let mut out = summary_json(&def, &hash);
        out["replaced"] = serde_json::Value::Bool(replaced);
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {} workflow '{}'",
            style("*").green().bold(),
            if replaced { "Updated" } else { "Imported" },
            style(&def.name).cyan()
        );
        println!("  Stages: {}", def.stages.len());
        println!("  Jobs: {}", job_count(&def));
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn list(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .definitions
        .list_definitions()
        .await
        .map_err(|e| anyhow!("Failed to list definitions: {e}"))?;

    if json {
        let mut out = Vec::with_capacity(defs.len());
        for def in &defs {
            out.push(summary_json(def, &definition_hash(def)?));
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflow definitions stored.");
        println!(
            "  Import one with: {}",
            style("conveyor definition import <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Project"),
            Cell::new("Version"),
            Cell::new("Stages"),
            Cell::new("Jobs"),
            Cell::new("Debug"),
        ]);

    for def in &defs {
        table.add_row(vec![
            Cell::new(&def.name),
            Cell::new(&def.project),
            Cell::new(&def.version),
            Cell::new(def.stages.len()),
            Cell::new(job_count(def)),
            Cell::new(if def.debug { "yes" } else { "" }),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: &str = r#"
name: release
stages:
  - name: build
    jobs:
      - name: compile
        spec:
          type: freestyle
          script: make
      - name: package
        spec:
          type: freestyle
          script: make dist
"#;

    #[test]
    fn lint_accepts_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.yaml");
        std::fs::write(&path, RELEASE).unwrap();

        let def = load(&path).unwrap();
        assert_eq!(job_count(&def), 2);
        lint(&path, true).unwrap();
    }

    #[test]
    fn lint_names_the_file_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "name: release\nstages: []\n").unwrap();

        let err = lint(&path, false).unwrap_err().to_string();
        assert!(err.contains("broken.yaml is invalid"), "{err}");

        let missing = dir.path().join("missing.yaml");
        let err = lint(&missing, false).unwrap_err().to_string();
        assert!(err.starts_with("Failed to read"), "{err}");
    }
}
