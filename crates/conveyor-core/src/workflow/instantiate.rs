//! Task instantiation: definition + arguments -> persisted `created` task.
//!
//! # Steps
//!
//! 1. Validate the definition and merge the caller's arguments over it.
//! 2. Allocate the next task id from the workflow's sequence.
//! 3. Snapshot the merged arguments without trigger controls.
//! 4. Render variables and expand every non-skipped job.
//! 5. Lint the result: at least one stage, no stage without jobs, unique
//!    job task names.
//! 6. Persist the task in `created`.
//!
//! Nothing is written unless every step succeeds. A sequence number
//! allocated before a later failure is not reused.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use conveyor_types::definition::WorkflowDefinition;
use conveyor_types::error::RepositoryError;
use conveyor_types::status::Status;
use conveyor_types::task::{Approval, StageTask, Task, TaskArgs};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::task::TaskRepository;

use super::args::merge_args;
use super::definition::{DefinitionError, definition_hash, validate_definition};
use super::expander::expand_job;
use super::render::{Variables, render, stage_variables, workflow_variables};

#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("failed to allocate task id: {0}")]
    Sequence(RepositoryError),

    #[error("failed to render job '{job}': {message}")]
    Render { job: String, message: String },

    #[error("task has no stages to run")]
    NoStages,

    #[error("stage '{0}' has no jobs after expansion")]
    EmptyStage(String),

    #[error("job task name '{0}' is not unique")]
    DuplicateJobTask(String),

    #[error("failed to persist task: {0}")]
    Persist(RepositoryError),
}

/// Instantiate and persist a new task.
pub async fn instantiate_task<R: TaskRepository>(
    repo: &R,
    def: &WorkflowDefinition,
    args: &TaskArgs,
) -> Result<Task, InstantiateError> {
    validate_definition(def)?;
    let merged = merge_args(def, args)?;
    let original_args = merged.without_hooks();
    let workflow_hash = definition_hash(def)?;

    let task_id = repo
        .next_sequence(&def.name)
        .await
        .map_err(InstantiateError::Sequence)?;

    let (workflow_args, stages) =
        materialize_stages(&original_args, task_id, &args.creator, original_args.debug)?;

    let task = Task {
        id: Uuid::now_v7(),
        workflow_name: def.name.clone(),
        task_id,
        display_name: def.display_name.clone(),
        project: def.project.clone(),
        status: Status::Created,
        creator: args.creator.clone(),
        revoker: None,
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
        debug: original_args.debug,
        is_restart: false,
        error: None,
        workflow_hash,
        params: workflow_args.params.clone(),
        global_context: BTreeMap::new(),
        original_args,
        workflow_args,
        stages,
    };

    repo.upsert(&task).await.map_err(InstantiateError::Persist)?;

    tracing::info!(
        task = %task.key(),
        creator = task.creator.as_str(),
        stages = task.stages.len(),
        debug = task.debug,
        "task instantiated"
    );

    Ok(task)
}

/// Render and expand a merged definition into stage tasks.
///
/// Returns the rendered definition alongside the stages. Stages whose jobs
/// are all skipped are omitted. Used both for new tasks and to re-derive
/// job payloads on retry, so it must stay a pure function of its inputs.
pub fn materialize_stages(
    args: &WorkflowDefinition,
    task_id: i64,
    creator: &str,
    debug: bool,
) -> Result<(WorkflowDefinition, Vec<StageTask>), InstantiateError> {
    let vars = workflow_variables(args, task_id, creator);
    let mut rendered = args.clone();
    let mut stages = Vec::with_capacity(args.stages.len());
    let mut names = HashSet::new();

    for stage in &mut rendered.stages {
        let scoped: Variables = stage_variables(&vars, stage);
        for job in &mut stage.jobs {
            job.spec = render(&job.spec, &scoped).map_err(|e| InstantiateError::Render {
                job: job.name.clone(),
                message: e.to_string(),
            })?;
        }

        if stage.jobs.iter().all(|job| job.skipped) {
            tracing::debug!(stage = stage.name.as_str(), "every job skipped, omitting stage");
            continue;
        }

        let jobs: Vec<_> = stage
            .jobs
            .iter()
            .filter(|job| !job.skipped)
            .flat_map(|job| expand_job(&args.name, job, debug))
            .collect();
        if jobs.is_empty() {
            return Err(InstantiateError::EmptyStage(stage.name.clone()));
        }
        for job in &jobs {
            if !names.insert(job.name.clone()) {
                return Err(InstantiateError::DuplicateJobTask(job.name.clone()));
            }
        }

        stages.push(StageTask {
            name: stage.name.clone(),
            parallel: stage.parallel,
            status: Status::Created,
            started_at: None,
            ended_at: None,
            error: None,
            approval: stage.approval.as_ref().map(Approval::from),
            jobs,
        });
    }

    if stages.is_empty() {
        return Err(InstantiateError::NoStages);
    }

    Ok((rendered, stages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::definition::{
        HookControl, HookKind, JobSpec, Param, TestingJobSpec,
    };
    use conveyor_types::task::{JobOverride, JobTaskSpec, ParamValue, TaskFilter};

    use crate::testing::{MemoryTaskRepository, freestyle_job, stage, workflow};

    fn args() -> TaskArgs {
        TaskArgs {
            creator: "alice".to_string(),
            ..TaskArgs::default()
        }
    }

    fn release() -> WorkflowDefinition {
        let mut def = workflow(
            "release",
            vec![
                stage("build", true, vec![freestyle_job("compile"), freestyle_job("lint")]),
                stage("ship", false, vec![freestyle_job("publish")]),
            ],
        );
        def.hooks.push(HookControl {
            name: "on-push".to_string(),
            kind: HookKind::GitPush,
            enabled: true,
            repo: Some("shop/api".to_string()),
            schedule: None,
        });
        def
    }

    async fn stored(repo: &MemoryTaskRepository) -> u64 {
        repo.list_by_filter(&TaskFilter::default()).await.unwrap().1
    }

    #[tokio::test]
    async fn creates_task_in_created_status() {
        let repo = MemoryTaskRepository::default();
        let task = instantiate_task(&repo, &release(), &args()).await.unwrap();

        assert_eq!(task.task_id, 1);
        assert_eq!(task.status, Status::Created);
        assert_eq!(task.stages.len(), 2);
        assert!(task.stages.iter().all(|s| s.status == Status::Created));
        assert_eq!(task.stages[0].jobs.len(), 2);
        assert_eq!(task.workflow_hash.len(), 64);
        assert_eq!(repo.find(&task.key()).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn sequence_increments_per_workflow() {
        let repo = MemoryTaskRepository::default();
        let first = instantiate_task(&repo, &release(), &args()).await.unwrap();
        let second = instantiate_task(&repo, &release(), &args()).await.unwrap();
        let other = instantiate_task(
            &repo,
            &workflow("nightly", vec![stage("run", false, vec![freestyle_job("job")])]),
            &args(),
        )
        .await
        .unwrap();

        assert_eq!((first.task_id, second.task_id, other.task_id), (1, 2, 1));
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn snapshot_strips_hooks() {
        let repo = MemoryTaskRepository::default();
        let task = instantiate_task(&repo, &release(), &args()).await.unwrap();
        assert!(task.original_args.hooks.is_empty());
        assert!(task.workflow_args.hooks.is_empty());
        assert_eq!(task.original_args.stages, release().stages);
    }

    #[tokio::test]
    async fn missing_required_param_persists_nothing() {
        let repo = MemoryTaskRepository::default();
        let mut def = release();
        def.params.push(Param {
            name: "branch".to_string(),
            value: String::new(),
            required: true,
            choices: Vec::new(),
            description: None,
        });

        let err = instantiate_task(&repo, &def, &args()).await.unwrap_err();
        assert!(matches!(err, InstantiateError::Definition(_)));
        assert_eq!(stored(&repo).await, 0);
    }

    #[tokio::test]
    async fn renders_params_into_payloads() {
        let repo = MemoryTaskRepository::default();
        let mut def = release();
        def.params.push(Param {
            name: "branch".to_string(),
            value: String::new(),
            required: true,
            choices: Vec::new(),
            description: None,
        });
        if let JobSpec::Freestyle(spec) = &mut def.stages[0].jobs[0].spec {
            spec.script = "build {{.workflow.params.branch}} #{{.workflow.task.id}} in {{.stage.name}}".to_string();
        }
        let mut args = args();
        args.params.push(ParamValue {
            name: "branch".to_string(),
            value: "main".to_string(),
        });

        let task = instantiate_task(&repo, &def, &args).await.unwrap();
        match &task.stages[0].jobs[0].spec {
            JobTaskSpec::Freestyle { script, .. } => assert_eq!(script, "build main #1 in build"),
            other => panic!("unexpected spec {other:?}"),
        }
        match &task.original_args.stages[0].jobs[0].spec {
            JobSpec::Freestyle(spec) => assert!(spec.script.contains("{{.workflow.params.branch}}")),
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[tokio::test]
    async fn fully_skipped_stage_is_omitted() {
        let repo = MemoryTaskRepository::default();
        let mut args = args();
        args.jobs.push(JobOverride {
            name: "publish".to_string(),
            skipped: Some(true),
            spec: None,
        });
        let task = instantiate_task(&repo, &release(), &args).await.unwrap();
        assert_eq!(task.stages.len(), 1);
        assert_eq!(task.stages[0].name, "build");
    }

    #[tokio::test]
    async fn every_job_skipped_is_rejected() {
        let repo = MemoryTaskRepository::default();
        let mut args = args();
        for name in ["compile", "lint", "publish"] {
            args.jobs.push(JobOverride {
                name: name.to_string(),
                skipped: Some(true),
                spec: None,
            });
        }
        let err = instantiate_task(&repo, &release(), &args).await.unwrap_err();
        assert!(matches!(err, InstantiateError::NoStages));
        assert_eq!(stored(&repo).await, 0);
    }

    #[tokio::test]
    async fn stage_with_empty_fan_out_is_rejected() {
        let repo = MemoryTaskRepository::default();
        let mut def = release();
        def.stages[1].jobs[0].spec = JobSpec::Testing(TestingJobSpec { modules: Vec::new() });

        let err = instantiate_task(&repo, &def, &args()).await.unwrap_err();
        assert!(matches!(err, InstantiateError::EmptyStage(ref s) if s == "ship"));
        assert_eq!(stored(&repo).await, 0);
    }

    #[tokio::test]
    async fn debug_mode_arms_before_breakpoints() {
        let repo = MemoryTaskRepository::default();
        let mut args = args();
        args.debug = Some(true);
        let task = instantiate_task(&repo, &release(), &args).await.unwrap();
        assert!(task.debug);
        assert!(task.stages.iter().flat_map(|s| &s.jobs).all(|j| j.breakpoint_before));
    }

    #[test]
    fn materialize_is_deterministic() {
        let def = release().without_hooks();
        let a = materialize_stages(&def, 4, "bob", false).unwrap();
        let b = materialize_stages(&def, 4, "bob", false).unwrap();
        assert_eq!(a, b);
    }
}
