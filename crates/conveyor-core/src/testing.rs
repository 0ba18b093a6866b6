//! In-memory fakes and fixtures shared by the engine's unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conveyor_types::definition::{
    FreestyleJobSpec, JobDefinition, JobSpec, StageDefinition, WorkflowDefinition,
};
use conveyor_types::error::RepositoryError;
use conveyor_types::event::BreakpointPosition;
use conveyor_types::status::Status;
use conveyor_types::task::{ExecutionHandle, JobTask, Task, TaskFilter, TaskKey, TaskSummary};

use crate::backend::BackendError;
use crate::backend::debug::{DebugChannel, DebugMarker};
use crate::backend::execution::{ExecutionBackend, JobReport};
use crate::backend::notify::Notifier;
use crate::controller::{ControllerSettings, TaskController};
use crate::event::bus::EventBus;
use crate::repository::definition::DefinitionStore;
use crate::repository::task::TaskRepository;
use crate::workflow::instantiate::materialize_stages;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

pub(crate) fn freestyle_job(name: &str) -> JobDefinition {
    JobDefinition {
        name: name.to_string(),
        skipped: false,
        optional: false,
        timeout_minutes: None,
        spec: JobSpec::Freestyle(FreestyleJobSpec {
            script: format!("./{name}.sh"),
            image: None,
            envs: Vec::new(),
            services: Vec::new(),
        }),
    }
}

pub(crate) fn stage(name: &str, parallel: bool, jobs: Vec<JobDefinition>) -> StageDefinition {
    StageDefinition {
        name: name.to_string(),
        parallel,
        approval: None,
        jobs,
    }
}

pub(crate) fn workflow(name: &str, stages: Vec<StageDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        display_name: String::new(),
        project: "shop".to_string(),
        version: "1".to_string(),
        description: None,
        params: Vec::new(),
        debug: false,
        hooks: Vec::new(),
        stages,
    }
}

/// A `created` task with a single `build` stage running `compile`.
pub(crate) fn sample_task(workflow_name: &str, task_id: i64) -> Task {
    let def = workflow(workflow_name, vec![stage("build", false, vec![freestyle_job("compile")])]);
    let (rendered, stages) = materialize_stages(&def, task_id, "alice", false).unwrap();
    Task {
        id: uuid::Uuid::now_v7(),
        workflow_name: workflow_name.to_string(),
        task_id,
        display_name: String::new(),
        project: def.project.clone(),
        status: Status::Created,
        creator: "alice".to_string(),
        revoker: None,
        created_at: chrono::Utc::now(),
        started_at: None,
        ended_at: None,
        debug: false,
        is_restart: false,
        error: None,
        workflow_hash: String::new(),
        params: Vec::new(),
        global_context: BTreeMap::new(),
        original_args: def,
        workflow_args: rendered,
        stages,
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MemoryTaskRepository {
    tasks: Mutex<HashMap<TaskKey, Task>>,
    sequences: Mutex<HashMap<String, i64>>,
    definitions: Mutex<BTreeMap<String, WorkflowDefinition>>,
    failing_writes: AtomicBool,
}

impl MemoryTaskRepository {
    /// Make every subsequent `upsert` fail until switched back off.
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.failing_writes.store(fail, Ordering::SeqCst);
    }
}

impl TaskRepository for MemoryTaskRepository {
    async fn find(&self, key: &TaskKey) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.lock().unwrap().get(key).cloned())
    }

    async fn upsert(&self, task: &Task) -> Result<(), RepositoryError> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        self.tasks.lock().unwrap().insert(task.key(), task.clone());
        Ok(())
    }

    async fn list_by_filter(&self, filter: &TaskFilter) -> Result<(Vec<TaskSummary>, u64), RepositoryError> {
        let mut matched: Vec<TaskSummary> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .map(Task::summary)
            .filter(|summary| filter.matches(summary))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.task_id.cmp(&a.task_id)));
        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskSummary>, RepositoryError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| !task.status.is_terminal())
            .map(Task::summary)
            .collect())
    }

    async fn next_sequence(&self, workflow_name: &str) -> Result<i64, RepositoryError> {
        let mut sequences = self.sequences.lock().unwrap();
        let seq = sequences.entry(workflow_name.to_string()).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }
}

impl DefinitionStore for MemoryTaskRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions
            .lock()
            .unwrap()
            .insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn find_definition(&self, name: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().get(name).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Fake cluster
// ---------------------------------------------------------------------------

/// How a fake unit's script step ends.
#[derive(Debug, Clone)]
pub(crate) enum JobPlan {
    Finish(JobReport),
    /// Stay in the script step until `FakeCluster::finish` is called.
    Hold,
}

impl JobPlan {
    pub(crate) fn pass() -> Self {
        JobPlan::Finish(JobReport::with_status(Status::Passed))
    }

    pub(crate) fn pass_with(outputs: &[(&str, &str)]) -> Self {
        let mut report = JobReport::with_status(Status::Passed);
        report.outputs = outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        JobPlan::Finish(report)
    }

    pub(crate) fn fail(error: &str) -> Self {
        JobPlan::Finish(JobReport::failed(error))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Before,
    Step,
    After,
}

struct FakeUnit {
    job: String,
    plan: JobPlan,
    phase: Phase,
    markers: HashSet<DebugMarker>,
    cancelled: bool,
}

#[derive(Default)]
struct ClusterState {
    plans: HashMap<String, VecDeque<JobPlan>>,
    units: HashMap<String, FakeUnit>,
    latest: HashMap<String, String>,
    submitted: Vec<String>,
    cancelled: Vec<String>,
    unreachable: bool,
}

/// Execution backend and debug channel over simulated units.
///
/// Each unit walks `before -> step -> after` one poll at a time, pausing
/// while the matching breakpoint marker exists and writing the step markers
/// the way a real unit would.
#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    /// Queue the outcome for the next submission of `job`.
    pub(crate) fn plan(&self, job: &str, plan: JobPlan) {
        self.state
            .lock()
            .unwrap()
            .plans
            .entry(job.to_string())
            .or_default()
            .push_back(plan);
    }

    /// End a held step of the latest unit for `job`.
    pub(crate) fn finish(&self, job: &str, plan: JobPlan) {
        let mut state = self.state.lock().unwrap();
        let unit = state.latest.get(job).cloned().unwrap();
        state.units.get_mut(&unit).unwrap().plan = plan;
    }

    /// Fail every status poll, as if the cluster API went away.
    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub(crate) fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub(crate) fn has_marker(&self, job: &str, marker: DebugMarker) -> bool {
        let state = self.state.lock().unwrap();
        state
            .latest
            .get(job)
            .and_then(|unit| state.units.get(unit))
            .is_some_and(|unit| unit.markers.contains(&marker))
    }

    fn with_unit<T>(
        &self,
        handle: &ExecutionHandle,
        f: impl FnOnce(&mut FakeUnit) -> T,
    ) -> Result<T, BackendError> {
        let mut state = self.state.lock().unwrap();
        let unit = state
            .units
            .get_mut(&handle.unit)
            .ok_or_else(|| BackendError::UnitNotFound(handle.unit.clone()))?;
        Ok(f(unit))
    }
}

impl ExecutionBackend for FakeCluster {
    async fn submit(&self, task: &TaskKey, job: &JobTask) -> Result<ExecutionHandle, BackendError> {
        let mut state = self.state.lock().unwrap();
        let unit = format!("{}-{}-{}-{}", task.workflow_name, task.task_id, job.name, state.submitted.len());
        let plan = state
            .plans
            .get_mut(&job.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(JobPlan::pass);
        let mut markers = HashSet::new();
        if job.breakpoint_before {
            markers.insert(DebugMarker::Breakpoint(BreakpointPosition::Before));
        }
        if job.breakpoint_after {
            markers.insert(DebugMarker::Breakpoint(BreakpointPosition::After));
        }
        state.units.insert(
            unit.clone(),
            FakeUnit {
                job: job.name.clone(),
                plan,
                phase: Phase::Before,
                markers,
                cancelled: false,
            },
        );
        state.latest.insert(job.name.clone(), unit.clone());
        state.submitted.push(job.name.clone());
        Ok(ExecutionHandle {
            unit,
            namespace: "ci".to_string(),
            container: None,
        })
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<JobReport, BackendError> {
        if self.state.lock().unwrap().unreachable {
            return Err(BackendError::Unavailable("cluster api unreachable".to_string()));
        }
        self.with_unit(handle, |unit| {
            if unit.cancelled {
                return JobReport::with_status(Status::Cancelled);
            }
            match unit.phase {
                Phase::Before => {
                    if unit
                        .markers
                        .contains(&DebugMarker::Breakpoint(BreakpointPosition::Before))
                    {
                        return JobReport::with_status(Status::DebugBefore);
                    }
                    unit.markers.insert(DebugMarker::StepStarted);
                    unit.phase = Phase::Step;
                    JobReport::running()
                }
                Phase::Step => {
                    if matches!(unit.plan, JobPlan::Hold) {
                        return JobReport::running();
                    }
                    unit.markers.insert(DebugMarker::StepDone);
                    unit.phase = Phase::After;
                    JobReport::running()
                }
                Phase::After => {
                    if unit
                        .markers
                        .contains(&DebugMarker::Breakpoint(BreakpointPosition::After))
                    {
                        return JobReport::with_status(Status::DebugAfter);
                    }
                    match &unit.plan {
                        JobPlan::Finish(report) => report.clone(),
                        JobPlan::Hold => JobReport::running(),
                    }
                }
            }
        })
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
        let job = self.with_unit(handle, |unit| {
            unit.cancelled = true;
            unit.job.clone()
        })?;
        self.state.lock().unwrap().cancelled.push(job);
        Ok(())
    }
}

impl DebugChannel for FakeCluster {
    async fn probe(&self, handle: &ExecutionHandle, marker: DebugMarker) -> Result<bool, BackendError> {
        self.with_unit(handle, |unit| unit.markers.contains(&marker))
    }

    async fn set(&self, handle: &ExecutionHandle, marker: DebugMarker) -> Result<(), BackendError> {
        self.with_unit(handle, |unit| {
            unit.markers.insert(marker);
        })
    }

    async fn clear(&self, handle: &ExecutionHandle, marker: DebugMarker) -> Result<(), BackendError> {
        self.with_unit(handle, |unit| {
            unit.markers.remove(&marker);
        })
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub(crate) struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(bool, String, String)>>>,
}

impl RecordingNotifier {
    /// `(success, title, text)` of every notification sent.
    pub(crate) fn sent(&self) -> Vec<(bool, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn notify_failure(&self, _owner: &str, title: &str, cause: &str) -> Result<(), BackendError> {
        self.sent
            .lock()
            .unwrap()
            .push((false, title.to_string(), cause.to_string()));
        Ok(())
    }

    async fn notify_success(&self, _owner: &str, title: &str, detail: &str) -> Result<(), BackendError> {
        self.sent
            .lock()
            .unwrap()
            .push((true, title.to_string(), detail.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Controller harness
// ---------------------------------------------------------------------------

pub(crate) type TestController =
    TaskController<MemoryTaskRepository, FakeCluster, FakeCluster, RecordingNotifier>;

pub(crate) fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        poll_interval: Duration::from_millis(5),
        approval_check_interval: Duration::from_millis(10),
        remote_timeout: Duration::from_secs(1),
        default_job_timeout: Duration::from_secs(60),
        stop_grace: Duration::from_millis(100),
    }
}

pub(crate) fn controller() -> (TestController, FakeCluster, RecordingNotifier) {
    controller_with(fast_settings())
}

pub(crate) fn controller_with(
    settings: ControllerSettings,
) -> (TestController, FakeCluster, RecordingNotifier) {
    let cluster = FakeCluster::default();
    let notifier = RecordingNotifier::default();
    let controller = TaskController::new(
        MemoryTaskRepository::default(),
        cluster.clone(),
        cluster.clone(),
        notifier.clone(),
        EventBus::new(256),
        settings,
    );
    (controller, cluster, notifier)
}

/// Poll the task until `predicate` holds. Panics after two seconds.
pub(crate) async fn wait_for(
    controller: &TestController,
    key: &TaskKey,
    predicate: impl Fn(&Task) -> bool,
) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let task = controller.snapshot(key).await.unwrap();
        if predicate(&task) {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached; task {key} is {}", task.status);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
