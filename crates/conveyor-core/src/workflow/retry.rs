//! Deriving a resumable task from a finished one.
//!
//! Retry keeps everything that passed and re-arms everything that did not:
//! non-passed stages and jobs go back to `created` with fresh payloads
//! re-expanded from the task's original arguments, and non-passed approval
//! gates are reset from the stage configuration in those arguments. The
//! record id and sequence number never change.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use conveyor_types::status::Status;
use conveyor_types::task::{ApprovalStatus, JobTask, Task, TaskKey};
use thiserror::Error;

use super::approval::ApprovalGate;
use super::instantiate::{InstantiateError, materialize_stages};

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("task {key} cannot be retried from status '{status}'")]
    NotRetryable { key: TaskKey, status: Status },

    #[error("stage '{0}' is missing from the task's original arguments")]
    MissingStage(String),

    #[error("no fresh payload for job task '{0}'")]
    MissingJob(String),

    #[error("failed to re-expand original arguments: {0}")]
    Expand(#[from] InstantiateError),
}

/// Re-expand the task's original arguments into job tasks keyed by job key.
pub fn fresh_jobs(task: &Task) -> Result<HashMap<String, JobTask>, RetryError> {
    let (_, stages) = materialize_stages(&task.original_args, task.task_id, &task.creator, task.debug)?;
    Ok(stages
        .into_iter()
        .flat_map(|stage| stage.jobs)
        .map(|job| (job.key.clone(), job))
        .collect())
}

/// Build the resumed form of a finished task.
///
/// Pure: `original` is not modified and nothing is persisted.
pub fn derive_resumed_task(
    original: &Task,
    fresh: &HashMap<String, JobTask>,
    now: DateTime<Utc>,
) -> Result<Task, RetryError> {
    if !original.status.is_retryable() {
        return Err(RetryError::NotRetryable {
            key: original.key(),
            status: original.status,
        });
    }

    let mut task = original.clone();

    for stage in task.stages.iter_mut().filter(|s| s.status != Status::Passed) {
        stage.status = Status::Created;
        stage.started_at = None;
        stage.ended_at = None;
        stage.error = None;

        if let Some(approval) = stage
            .approval
            .as_mut()
            .filter(|a| a.enabled && a.status != ApprovalStatus::Passed)
        {
            let spec = original
                .original_args
                .stage(&stage.name)
                .ok_or_else(|| RetryError::MissingStage(stage.name.clone()))?
                .approval
                .as_ref()
                .ok_or_else(|| RetryError::MissingStage(stage.name.clone()))?;
            ApprovalGate::new(approval).reset(spec);
        }

        for job in stage.jobs.iter_mut().filter(|j| j.status != Status::Passed) {
            let fresh_job = fresh
                .get(&job.key)
                .ok_or_else(|| RetryError::MissingJob(job.name.clone()))?;
            job.spec = fresh_job.spec.clone();
            job.status = Status::Created;
            job.started_at = None;
            job.ended_at = None;
            job.error = None;
            job.outputs.clear();
            job.execution = None;
        }
    }

    task.status = Status::Created;
    task.started_at = Some(now);
    task.ended_at = None;
    task.error = None;
    task.revoker = None;
    task.is_restart = true;

    Ok(task)
}
