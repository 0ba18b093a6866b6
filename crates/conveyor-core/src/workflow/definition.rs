//! Pipeline definition parsing, validation and hashing.
//!
//! Validation runs both when a definition is imported and again before every
//! instantiation, so a definition edited in the store can never produce a
//! malformed task.

use std::collections::HashSet;
use std::path::Path;

use conveyor_types::definition::WorkflowDefinition;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum length of a job name.
pub const MAX_JOB_NAME_LEN: usize = 32;

/// Maximum length of a workflow name.
pub const MAX_WORKFLOW_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(message: impl Into<String>) -> DefinitionError {
    DefinitionError::Validation(message.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Read and parse a definition file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Hex SHA-256 of the definition's canonical JSON form.
pub fn definition_hash(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    let bytes = serde_json::to_vec(def).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Workflow and job names follow the naming policy (lowercase letters,
///   digits and hyphens)
/// - At least one stage, and every stage has at least one job
/// - Stage names are unique, job names are unique across the workflow
/// - Parameter names are unique and choice parameters hold a valid value
/// - Enabled approval gates have a satisfiable quorum and a positive timeout
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    validate_name("workflow", &def.name, MAX_WORKFLOW_NAME_LEN)?;

    if def.stages.is_empty() {
        return Err(invalid("workflow must have at least one stage"));
    }

    let mut params = HashSet::new();
    for param in &def.params {
        if param.name.is_empty() {
            return Err(invalid("parameter name must not be empty"));
        }
        if !params.insert(param.name.as_str()) {
            return Err(invalid(format!("duplicate parameter: '{}'", param.name)));
        }
        if !param.choices.is_empty()
            && !param.value.is_empty()
            && !param.choices.contains(&param.value)
        {
            return Err(invalid(format!(
                "parameter '{}' value '{}' is not one of {:?}",
                param.name, param.value, param.choices
            )));
        }
    }

    let mut stages = HashSet::new();
    let mut jobs = HashSet::new();
    for stage in &def.stages {
        if stage.name.trim().is_empty() {
            return Err(invalid("stage name must not be empty"));
        }
        if !stages.insert(stage.name.as_str()) {
            return Err(invalid(format!("duplicate stage: '{}'", stage.name)));
        }
        if stage.jobs.is_empty() {
            return Err(invalid(format!("stage '{}' has no jobs", stage.name)));
        }

        if let Some(approval) = stage.approval.as_ref().filter(|a| a.enabled) {
            if approval.needed_approvers == 0 {
                return Err(invalid(format!(
                    "stage '{}': approval needs at least one approver",
                    stage.name
                )));
            }
            if !approval.approvers.is_empty()
                && approval.needed_approvers as usize > approval.approvers.len()
            {
                return Err(invalid(format!(
                    "stage '{}': approval needs {} approvers but only {} are allowed",
                    stage.name,
                    approval.needed_approvers,
                    approval.approvers.len()
                )));
            }
            if approval.timeout_minutes == 0 {
                return Err(invalid(format!(
                    "stage '{}': approval timeout must be greater than 0",
                    stage.name
                )));
            }
        }

        for job in &stage.jobs {
            validate_name("job", &job.name, MAX_JOB_NAME_LEN)?;
            if !jobs.insert(job.name.as_str()) {
                return Err(invalid(format!("duplicate job: '{}'", job.name)));
            }
            if job.timeout_minutes == Some(0) {
                return Err(invalid(format!(
                    "job '{}': timeout must be greater than 0",
                    job.name
                )));
            }
        }
    }

    Ok(())
}

fn validate_name(kind: &str, name: &str, max_len: usize) -> Result<(), DefinitionError> {
    if name.is_empty() {
        return Err(invalid(format!("{kind} name must not be empty")));
    }
    if name.len() > max_len {
        return Err(invalid(format!(
            "{kind} name '{name}' is longer than {max_len} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(format!(
            "{kind} name '{name}' contains invalid characters (only lowercase letters, digits and hyphens allowed)"
        )));
    }
    Ok(())
}
