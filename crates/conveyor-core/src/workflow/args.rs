//! Merging caller arguments over a definition.

use conveyor_types::definition::WorkflowDefinition;
use conveyor_types::task::TaskArgs;

use super::definition::DefinitionError;

/// Apply parameter values, job overrides and the debug flag to a copy of the
/// definition.
///
/// Fails when a parameter or job is unknown, when an override changes a
/// job's kind, or when a required parameter ends up empty.
pub fn merge_args(
    def: &WorkflowDefinition,
    args: &TaskArgs,
) -> Result<WorkflowDefinition, DefinitionError> {
    let mut merged = def.clone();

    for value in &args.params {
        let param = merged
            .params
            .iter_mut()
            .find(|param| param.name == value.name)
            .ok_or_else(|| {
                DefinitionError::Validation(format!("unknown parameter: '{}'", value.name))
            })?;
        param.value = value.value.clone();
    }

    for param in &merged.params {
        if param.required && param.value.trim().is_empty() {
            return Err(DefinitionError::Validation(format!(
                "missing required parameter: '{}'",
                param.name
            )));
        }
        if !param.choices.is_empty()
            && !param.value.is_empty()
            && !param.choices.contains(&param.value)
        {
            return Err(DefinitionError::Validation(format!(
                "parameter '{}' value '{}' is not one of {:?}",
                param.name, param.value, param.choices
            )));
        }
    }

    for over in &args.jobs {
        let job = merged
            .stages
            .iter_mut()
            .flat_map(|stage| stage.jobs.iter_mut())
            .find(|job| job.name == over.name)
            .ok_or_else(|| DefinitionError::Validation(format!("unknown job: '{}'", over.name)))?;

        if let Some(spec) = &over.spec {
            if spec.job_type() != job.job_type() {
                return Err(DefinitionError::Validation(format!(
                    "job '{}' is a {} job and cannot be overridden with a {} payload",
                    job.name,
                    job.job_type(),
                    spec.job_type()
                )));
            }
            job.spec = spec.clone();
        }
        if let Some(skipped) = over.skipped {
            job.skipped = skipped;
        }
    }

    if let Some(debug) = args.debug {
        merged.debug = debug;
    }

    Ok(merged)
}
