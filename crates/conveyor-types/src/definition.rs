//! Pipeline definition types.
//!
//! A `WorkflowDefinition` is the versioned, immutable template a task is
//! instantiated from: ordered stages, each holding heterogeneous jobs and an
//! optional approval gate. Job payloads are a closed sum type keyed by the
//! job kind so that fan-out is an exhaustive match, never a type probe.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A versioned pipeline template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow name; scopes the task sequence.
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub project: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Workflow-level parameters, rendered as `{{.workflow.params.<name>}}`.
    #[serde(default)]
    pub params: Vec<Param>,
    /// Start every task of this workflow in debug mode.
    #[serde(default)]
    pub debug: bool,
    /// Trigger-control objects. Never copied into a task snapshot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookControl>,
    pub stages: Vec<StageDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

impl WorkflowDefinition {
    /// Look up a job definition by name across all stages.
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.stages
            .iter()
            .flat_map(|stage| stage.jobs.iter())
            .find(|job| job.name == name)
    }

    /// Look up a stage definition by name.
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Copy of this definition with trigger-control objects removed.
    pub fn without_hooks(&self) -> Self {
        Self {
            hooks: Vec::new(),
            ..self.clone()
        }
    }
}

/// A workflow parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub value: String,
    /// A required parameter must carry a non-empty value after argument merge.
    #[serde(default)]
    pub required: bool,
    /// When non-empty, the value must be one of these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An external trigger bound to the workflow (git hook, schedule, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookControl {
    pub name: String,
    pub kind: HookKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    GitPush,
    MergeRequest,
    Tag,
    Cron,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Stage Definition
// ---------------------------------------------------------------------------

/// An ordered group of jobs with an optional entry gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Run the stage's jobs concurrently instead of in list order.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
    pub jobs: Vec<JobDefinition>,
}

/// Human approval gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub kind: ApprovalKind,
    /// Minutes before an undecided gate resolves to `reject`.
    #[serde(default = "default_approval_timeout")]
    pub timeout_minutes: u64,
    /// Distinct approvals required to pass the gate.
    #[serde(default = "default_needed_approvers")]
    pub needed_approvers: u32,
    /// Decider ids allowed to vote. Empty means anyone.
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_approval_timeout() -> u64 {
    60
}

fn default_needed_approvers() -> u32 {
    1
}

/// Where the approval request is surfaced. The gate logic is identical for
/// every kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalKind {
    #[default]
    Native,
    Chat { platform: String },
}

// ---------------------------------------------------------------------------
// Job Definition
// ---------------------------------------------------------------------------

/// A unit of work inside a stage, expanded into one or more job tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique within the workflow. Lowercase letters, digits and '-'.
    pub name: String,
    #[serde(default)]
    pub skipped: bool,
    /// A failing optional job does not fail its stage.
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    pub spec: JobSpec,
}

impl JobDefinition {
    pub fn job_type(&self) -> JobType {
        self.spec.job_type()
    }
}

/// Kind-specific job payload.
///
/// Internally tagged by `type`:
/// ```yaml
/// spec:
///   type: build
///   services:
///     - service_name: api
///       service_module: api-server
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSpec {
    Build(BuildJobSpec),
    Deploy(DeployJobSpec),
    Freestyle(FreestyleJobSpec),
    Testing(TestingJobSpec),
    Scanning(ScanningJobSpec),
}

impl JobSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            JobSpec::Build(_) => JobType::Build,
            JobSpec::Deploy(_) => JobType::Deploy,
            JobSpec::Freestyle(_) => JobType::Freestyle,
            JobSpec::Testing(_) => JobType::Testing,
            JobSpec::Scanning(_) => JobType::Scanning,
        }
    }
}

/// Discriminant of [`JobSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Build,
    Deploy,
    Freestyle,
    Testing,
    Scanning,
}

impl JobType {
    /// Kinds that run a user shell step and can pause at breakpoints.
    pub fn supports_debug(&self) -> bool {
        !matches!(self, JobType::Deploy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Build => "build",
            JobType::Deploy => "deploy",
            JobType::Freestyle => "freestyle",
            JobType::Testing => "testing",
            JobType::Scanning => "scanning",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key/value pair injected into the job environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub is_credential: bool,
}

/// Fan out a build over service modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJobSpec {
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub envs: Vec<KeyVal>,
    pub services: Vec<ServiceBuild>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBuild {
    pub service_name: String,
    pub service_module: String,
    #[serde(default)]
    pub build_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub envs: Vec<KeyVal>,
}

/// Roll service images out to an environment, one job task per service module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployJobSpec {
    pub env: String,
    #[serde(default)]
    pub production: bool,
    pub services: Vec<ServiceImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceImage {
    pub service_name: String,
    pub service_module: String,
    /// Image reference; may reference an upstream output such as
    /// `{{.job.build-api.IMAGE}}`.
    pub image: String,
}

/// A user script, optionally fanned out over services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreestyleJobSpec {
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub envs: Vec<KeyVal>,
    /// When empty the job expands to a single task.
    #[serde(default)]
    pub services: Vec<ServiceRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub service_name: String,
    pub service_module: String,
}

/// One job task per test module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingJobSpec {
    pub modules: Vec<TestModule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestModule {
    pub name: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub envs: Vec<KeyVal>,
}

/// One job task per code scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanningJobSpec {
    pub scannings: Vec<ScanningModule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanningModule {
    pub name: String,
    #[serde(default)]
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}
