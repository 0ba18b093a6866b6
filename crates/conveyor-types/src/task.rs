//! Task instance types.
//!
//! A `Task` is one concrete execution of a workflow definition, identified by
//! `(workflow_name, task_id)` where `task_id` is a per-workflow sequence.
//! It carries two copies of the definition: `original_args` (the merged
//! arguments exactly as requested, never mutated) and `workflow_args` (the
//! rendered form the jobs were expanded from). Retry re-expands from
//! `original_args`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{ApprovalKind, ApprovalSpec, JobSpec, JobType, KeyVal, Param, ServiceRef, WorkflowDefinition};
use crate::status::Status;

// ---------------------------------------------------------------------------
// Task identity
// ---------------------------------------------------------------------------

/// Address of a task: workflow name plus per-workflow sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub workflow_name: String,
    pub task_id: i64,
}

impl TaskKey {
    pub fn new(workflow_name: impl Into<String>, task_id: i64) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            task_id,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.workflow_name, self.task_id)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Record identity. Stable across retries.
    pub id: Uuid,
    pub workflow_name: String,
    /// Per-workflow sequence number, allocated once at instantiation.
    pub task_id: i64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub project: String,
    pub status: Status,
    pub creator: String,
    /// User who cancelled the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoker: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub debug: bool,
    /// Set once the task has been resumed by a retry.
    #[serde(default)]
    pub is_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SHA-256 of the stored definition the task was created from.
    #[serde(default)]
    pub workflow_hash: String,
    #[serde(default)]
    pub params: Vec<Param>,
    /// Job outputs published for downstream jobs, keyed by template
    /// placeholder (`{{.job.<job>.<output>}}`).
    #[serde(default)]
    pub global_context: BTreeMap<String, String>,
    pub original_args: WorkflowDefinition,
    pub workflow_args: WorkflowDefinition,
    pub stages: Vec<StageTask>,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.workflow_name.clone(), self.task_id)
    }

    /// Position `(stage index, job index)` of the job task with this name.
    pub fn locate_job(&self, job_name: &str) -> Option<(usize, usize)> {
        self.stages.iter().enumerate().find_map(|(stage_idx, stage)| {
            stage
                .jobs
                .iter()
                .position(|job| job.name == job_name)
                .map(|job_idx| (stage_idx, job_idx))
        })
    }

    pub fn job(&self, job_name: &str) -> Option<&JobTask> {
        self.locate_job(job_name)
            .map(|(stage_idx, job_idx)| &self.stages[stage_idx].jobs[job_idx])
    }

    pub fn job_mut(&mut self, job_name: &str) -> Option<&mut JobTask> {
        let (stage_idx, job_idx) = self.locate_job(job_name)?;
        Some(&mut self.stages[stage_idx].jobs[job_idx])
    }

    pub fn stage_mut(&mut self, stage_name: &str) -> Option<&mut StageTask> {
        self.stages.iter_mut().find(|stage| stage.name == stage_name)
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            workflow_name: self.workflow_name.clone(),
            task_id: self.task_id,
            project: self.project.clone(),
            status: self.status,
            creator: self.creator.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            is_restart: self.is_restart,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTask {
    pub name: String,
    #[serde(default)]
    pub parallel: bool,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
    pub jobs: Vec<JobTask>,
}

impl StageTask {
    /// Whether the stage must wait on a human decision before running jobs.
    pub fn gated(&self) -> bool {
        self.approval.as_ref().is_some_and(|approval| approval.enabled)
    }
}

// ---------------------------------------------------------------------------
// Approval gate state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// The stage has not been reached yet.
    #[default]
    Waiting,
    /// Collecting decisions.
    Pending,
    Passed,
    Reject,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_decided(&self) -> bool {
        matches!(
            self,
            ApprovalStatus::Passed | ApprovalStatus::Reject | ApprovalStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Waiting => "waiting",
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Passed => "passed",
            ApprovalStatus::Reject => "reject",
            ApprovalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// Who is casting a decision on a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decider {
    pub id: String,
    pub name: String,
}

impl Decider {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decider: Decider,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Runtime state of a stage's approval gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub enabled: bool,
    #[serde(default)]
    pub kind: ApprovalKind,
    pub timeout_minutes: u64,
    pub needed_approvers: u32,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ApprovalStatus,
    #[serde(default)]
    pub decisions: Vec<ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

impl From<&ApprovalSpec> for Approval {
    fn from(spec: &ApprovalSpec) -> Self {
        Self {
            enabled: spec.enabled,
            kind: spec.kind.clone(),
            timeout_minutes: spec.timeout_minutes,
            needed_approvers: spec.needed_approvers,
            approvers: spec.approvers.clone(),
            description: spec.description.clone(),
            status: ApprovalStatus::Waiting,
            decisions: Vec::new(),
            started_at: None,
            decided_at: None,
            reject_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Job task
// ---------------------------------------------------------------------------

/// The execution unit a backend created for a job task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub unit: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// One concrete, schedulable unit produced by expanding a job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTask {
    /// `{workflow}/{job}/{fan-out index}`. Stable across retries.
    pub key: String,
    /// Unique within the task. Breakpoints are addressed by this name.
    pub name: String,
    /// Name of the job definition this task was expanded from.
    pub job_name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub breakpoint_before: bool,
    #[serde(default)]
    pub breakpoint_after: bool,
    pub spec: JobTaskSpec,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionHandle>,
}

impl JobTask {
    pub fn job_type(&self) -> JobType {
        self.spec.job_type()
    }
}

/// Kind-specific payload of a single job task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTaskSpec {
    Build {
        service_name: String,
        service_module: String,
        build_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        script: String,
        envs: Vec<KeyVal>,
    },
    Deploy {
        env: String,
        production: bool,
        service_name: String,
        service_module: String,
        image: String,
    },
    Freestyle {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        envs: Vec<KeyVal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<ServiceRef>,
    },
    Testing {
        module: String,
        script: String,
        envs: Vec<KeyVal>,
    },
    Scanning {
        name: String,
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
    },
}

impl JobTaskSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            JobTaskSpec::Build { .. } => JobType::Build,
            JobTaskSpec::Deploy { .. } => JobType::Deploy,
            JobTaskSpec::Freestyle { .. } => JobType::Freestyle,
            JobTaskSpec::Testing { .. } => JobType::Testing,
            JobTaskSpec::Scanning { .. } => JobType::Scanning,
        }
    }
}

// ---------------------------------------------------------------------------
// Instantiation arguments
// ---------------------------------------------------------------------------

/// Caller-supplied arguments merged over a definition to create a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskArgs {
    pub creator: String,
    #[serde(default)]
    pub params: Vec<ParamValue>,
    #[serde(default)]
    pub jobs: Vec<JobOverride>,
    /// Overrides the definition's debug flag when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamValue {
    pub name: String,
    pub value: String,
}

/// Per-job override: skip the job and/or replace its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<JobSpec>,
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Lightweight row for task listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub workflow_name: String,
    pub task_id: i64,
    pub project: String,
    pub status: Status,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_restart: bool,
}

/// Filter for `list_by_filter`. Empty vectors match everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub creators: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<Status>,
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            workflow_name: None,
            project: None,
            creators: Vec::new(),
            statuses: Vec::new(),
            limit: 20,
            offset: 0,
        }
    }
}

impl TaskFilter {
    pub fn matches(&self, summary: &TaskSummary) -> bool {
        self.workflow_name
            .as_deref()
            .is_none_or(|name| summary.workflow_name == name)
            && self
                .project
                .as_deref()
                .is_none_or(|project| summary.project == project)
            && (self.creators.is_empty() || self.creators.contains(&summary.creator))
            && (self.statuses.is_empty() || self.statuses.contains(&summary.status))
    }
}
