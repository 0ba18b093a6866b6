//! Task controller: owns live tasks and every out-of-band operation on them.
//!
//! The controller keeps one registry entry per task it is driving. Each
//! entry's state is guarded by a single lock. Every operation here (approval
//! decisions, cancellation, breakpoint control) takes that lock and validates
//! the request. It then writes the changed copy to the task store and
//! installs it only once the write succeeded, so a failed write leaves the
//! live task as it was. Callers only ever see snapshots.
//!
//! # Lifecycle
//!
//! 1. `create_task` instantiates a task and `submit`s it.
//! 2. `submit` registers it and spawns its driver (see `driver`).
//! 3. The driver runs stages in order, waiting on approval gates and polling
//!    the execution backend for job status.
//! 4. On a terminal status the driver persists the task, removes it from the
//!    registry and sends a notification.
//! 5. `retry` re-registers a finished task in its resumed form.

pub mod debug;
mod driver;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_types::config::EngineSettings;
use conveyor_types::definition::WorkflowDefinition;
use conveyor_types::error::RepositoryError;
use conveyor_types::event::TaskEvent;
use conveyor_types::status::Status;
use conveyor_types::task::{ApprovalStatus, Decider, Decision, Task, TaskArgs, TaskKey};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::backend::debug::DebugChannel;
use crate::backend::execution::ExecutionBackend;
use crate::backend::notify::Notifier;
use crate::event::bus::EventBus;
use crate::repository::task::TaskRepository;
use crate::workflow::approval::{ApprovalError, ApprovalGate};
use crate::workflow::instantiate::{InstantiateError, instantiate_task};
use crate::workflow::retry::{RetryError, derive_resumed_task, fresh_jobs};

pub use debug::DebugError;
use registry::{LiveTask, TaskRegistry};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Timing knobs for the controller and its drivers.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub poll_interval: Duration,
    pub approval_check_interval: Duration,
    /// Bound on each remote probe/set/clear during breakpoint control.
    pub remote_timeout: Duration,
    pub default_job_timeout: Duration,
    /// Time a stopped unit gets to report a terminal status.
    pub stop_grace: Duration,
}

impl From<&EngineSettings> for ControllerSettings {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            approval_check_interval: Duration::from_millis(settings.approval_check_interval_ms),
            remote_timeout: Duration::from_secs(settings.remote_exec_timeout_secs),
            default_job_timeout: Duration::from_secs(settings.default_job_timeout_minutes * 60),
            stop_grace: Duration::from_secs(settings.stop_grace_secs),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("task {0} not found or already finished")]
    NotLive(TaskKey),

    #[error("task {0} not found")]
    NotFound(TaskKey),

    #[error("task {0} is already running")]
    AlreadyLive(TaskKey),

    #[error("task {key} must be in 'created' to be submitted, found '{status}'")]
    NotSubmittable { key: TaskKey, status: Status },

    #[error("stage '{stage}' not found in task {key}")]
    StageNotFound { key: TaskKey, stage: String },

    #[error("stage '{0}' has no approval gate")]
    NoApproval(String),

    #[error("job '{job}' not found in task {key}")]
    JobNotFound { key: TaskKey, job: String },

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Debug(#[from] DebugError),

    #[error(transparent)]
    Instantiate(#[from] InstantiateError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("task driver failed: {0}")]
    Driver(String),
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Handle to a task driver spawned by `submit`.
pub struct TaskHandle {
    key: TaskKey,
    join: JoinHandle<Status>,
}

impl TaskHandle {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Wait for the driver to finish and return the task's final status.
    pub async fn wait(self) -> Result<Status, ControllerError> {
        self.join
            .await
            .map_err(|e| ControllerError::Driver(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Shared<R, B, D, N> {
    pub(crate) repo: R,
    pub(crate) backend: B,
    pub(crate) debug: D,
    pub(crate) notifier: N,
    pub(crate) registry: TaskRegistry,
    pub(crate) events: EventBus,
    pub(crate) settings: ControllerSettings,
}

impl<R, B, D, N> Shared<R, B, D, N>
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    /// Persist the task before the caller releases its lock.
    pub(crate) async fn ack(&self, live: &LiveTask, task: &Task) -> Result<(), RepositoryError> {
        let revision = live.stamp();
        live.flush(&self.repo, revision, task).await.map(|_| ())
    }

    /// Persist `updated` and install it as the live state. A failed write
    /// leaves `current` untouched.
    pub(crate) async fn commit(
        &self,
        live: &LiveTask,
        current: &mut Task,
        updated: Task,
    ) -> Result<(), RepositoryError> {
        self.ack(live, &updated).await?;
        *current = updated;
        Ok(())
    }

    /// Persist the task in the background. Used for job polling updates.
    pub(crate) fn ack_deferred(self: &Arc<Self>, live: &Arc<LiveTask>, task: &Task) {
        let revision = live.stamp();
        let snapshot = task.clone();
        let shared = Arc::clone(self);
        let live = Arc::clone(live);
        tokio::spawn(async move {
            if let Err(e) = live.flush(&shared.repo, revision, &snapshot).await {
                tracing::warn!(task = %live.key(), revision, "deferred task write failed: {e}");
            }
        });
    }

    pub(crate) fn publish(&self, event: TaskEvent) {
        self.events.publish(event);
    }
}

// ---------------------------------------------------------------------------
// TaskController
// ---------------------------------------------------------------------------

/// Drives workflow tasks and serializes every control operation per task.
///
/// Generic over the task store, execution backend, debug channel and
/// notifier. Cloning is cheap and shares the registry.
pub struct TaskController<R, B, D, N> {
    shared: Arc<Shared<R, B, D, N>>,
}

impl<R, B, D, N> Clone for TaskController<R, B, D, N> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R, B, D, N> TaskController<R, B, D, N>
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    pub fn new(
        repo: R,
        backend: B,
        debug: D,
        notifier: N,
        events: EventBus,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                repo,
                backend,
                debug,
                notifier,
                registry: TaskRegistry::default(),
                events,
                settings,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn repository(&self) -> &R {
        &self.shared.repo
    }

    /// Keys of every task currently being driven.
    pub fn live_tasks(&self) -> Vec<TaskKey> {
        self.shared.registry.keys()
    }

    pub fn is_live(&self, key: &TaskKey) -> bool {
        self.shared.registry.contains(key)
    }

    fn live(&self, key: &TaskKey) -> Result<Arc<LiveTask>, ControllerError> {
        self.shared
            .registry
            .get(key)
            .ok_or_else(|| ControllerError::NotLive(key.clone()))
    }

    /// Instantiate a task from a definition and start driving it.
    pub async fn create_task(
        &self,
        def: &WorkflowDefinition,
        args: &TaskArgs,
    ) -> Result<TaskHandle, ControllerError> {
        let task = instantiate_task(&self.shared.repo, def, args).await?;
        self.shared.publish(TaskEvent::TaskCreated {
            key: task.key(),
            creator: task.creator.clone(),
        });
        self.submit(task)
    }

    /// Start driving a persisted task in `created`.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, ControllerError> {
        if task.status != Status::Created {
            return Err(ControllerError::NotSubmittable {
                key: task.key(),
                status: task.status,
            });
        }
        let key = task.key();
        let live = self
            .shared
            .registry
            .insert(task)
            .ok_or_else(|| ControllerError::AlreadyLive(key.clone()))?;
        Ok(self.launch(live))
    }

    fn launch(&self, live: Arc<LiveTask>) -> TaskHandle {
        let key = live.key().clone();
        let join = tokio::spawn(driver::drive(Arc::clone(&self.shared), live));
        TaskHandle { key, join }
    }

    /// Current state of a task: the live copy if it is being driven,
    /// otherwise the stored record.
    pub async fn snapshot(&self, key: &TaskKey) -> Result<Task, ControllerError> {
        if let Some(live) = self.shared.registry.get(key) {
            return Ok(live.lock().await.clone());
        }
        self.shared
            .repo
            .find(key)
            .await?
            .ok_or_else(|| ControllerError::NotFound(key.clone()))
    }

    // -----------------------------------------------------------------------
    // Approval
    // -----------------------------------------------------------------------

    pub async fn approve(
        &self,
        key: &TaskKey,
        stage: &str,
        decider: &Decider,
        comment: Option<String>,
    ) -> Result<ApprovalStatus, ControllerError> {
        self.decide(key, stage, decider, Decision::Approve, comment).await
    }

    pub async fn reject(
        &self,
        key: &TaskKey,
        stage: &str,
        decider: &Decider,
        comment: Option<String>,
    ) -> Result<ApprovalStatus, ControllerError> {
        self.decide(key, stage, decider, Decision::Reject, comment).await
    }

    async fn decide(
        &self,
        key: &TaskKey,
        stage_name: &str,
        decider: &Decider,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<ApprovalStatus, ControllerError> {
        let live = self.live(key)?;
        let mut task = live.lock().await;
        if task.status.is_terminal() {
            return Err(ControllerError::NotLive(key.clone()));
        }

        let mut updated = task.clone();
        let stage = updated
            .stage_mut(stage_name)
            .ok_or_else(|| ControllerError::StageNotFound {
                key: key.clone(),
                stage: stage_name.to_string(),
            })?;
        let approval = stage
            .approval
            .as_mut()
            .ok_or_else(|| ControllerError::NoApproval(stage_name.to_string()))?;

        let recorded_before = approval.decisions.len();
        let status = ApprovalGate::new(approval).decide(decider, decision, comment, Utc::now())?;
        let recorded = approval.decisions.len() != recorded_before;

        if recorded {
            self.shared.commit(&live, &mut task, updated).await?;
            drop(task);
            live.wake();
            self.shared.publish(TaskEvent::ApprovalChanged {
                key: key.clone(),
                stage: stage_name.to_string(),
                status,
            });
        }

        tracing::info!(
            task = %key,
            stage = stage_name,
            decider = decider.id.as_str(),
            ?decision,
            ?status,
            recorded,
            "approval decision"
        );
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Request cancellation of a live task.
    ///
    /// Marks every not-yet-started job and every undecided gate of the
    /// current and later stages `cancelled`, acknowledges, then signals the
    /// driver. Jobs already running are stopped through the backend and keep
    /// whatever terminal status the backend reports. A unit that reports none
    /// within the stop grace is recorded as `cancelled`.
    pub async fn cancel(&self, key: &TaskKey, revoker: &str) -> Result<(), ControllerError> {
        let live = self.live(key)?;
        let mut task = live.lock().await;
        if task.status.is_terminal() {
            return Err(ControllerError::NotLive(key.clone()));
        }
        if live.cancel_token().is_cancelled() {
            return Ok(());
        }

        let now = Utc::now();
        let mut updated = task.clone();
        updated.revoker = Some(revoker.to_string());
        let mut cancelled_jobs = Vec::new();
        for stage in updated.stages.iter_mut().filter(|s| !s.status.is_terminal()) {
            if let Some(approval) = stage.approval.as_mut() {
                ApprovalGate::new(approval).cancel(now);
            }
            for job in stage.jobs.iter_mut().filter(|j| j.status == Status::Created) {
                job.status = Status::Cancelled;
                job.ended_at = Some(now);
                cancelled_jobs.push(job.name.clone());
            }
            if matches!(stage.status, Status::Created | Status::Pending) {
                stage.status = Status::Cancelled;
                stage.ended_at = Some(now);
            }
        }

        self.shared.commit(&live, &mut task, updated).await?;
        live.cancel_token().cancel();
        drop(task);
        live.wake();

        tracing::info!(task = %key, revoker, pending_jobs = cancelled_jobs.len(), "task cancellation requested");
        self.shared.publish(TaskEvent::TaskCancelled {
            key: key.clone(),
            revoker: revoker.to_string(),
        });
        for job in cancelled_jobs {
            self.shared.publish(TaskEvent::JobChanged {
                key: key.clone(),
                job,
                status: Status::Cancelled,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Retry & recovery
    // -----------------------------------------------------------------------

    /// Resume a finished task from its first non-passed stage.
    pub async fn retry(&self, key: &TaskKey) -> Result<TaskHandle, ControllerError> {
        if self.shared.registry.contains(key) {
            return Err(ControllerError::AlreadyLive(key.clone()));
        }
        let task = self
            .shared
            .repo
            .find(key)
            .await?
            .ok_or_else(|| ControllerError::NotFound(key.clone()))?;

        let fresh = fresh_jobs(&task)?;
        let resumed = derive_resumed_task(&task, &fresh, Utc::now())?;

        let live = self
            .shared
            .registry
            .insert(resumed.clone())
            .ok_or_else(|| ControllerError::AlreadyLive(key.clone()))?;
        if let Err(e) = self.shared.repo.upsert(&resumed).await {
            self.shared.registry.remove(key);
            return Err(e.into());
        }

        tracing::info!(task = %key, previous = %task.status, "retrying task");
        Ok(self.launch(live))
    }

    /// Fail stored tasks that are unfinished but not live, so they can be
    /// retried. Meant to run once at startup.
    pub async fn recover_interrupted(&self) -> Result<Vec<TaskKey>, ControllerError> {
        let now = Utc::now();
        let mut recovered = Vec::new();
        for summary in self.shared.repo.list_unfinished().await? {
            let key = TaskKey::new(summary.workflow_name, summary.task_id);
            if self.shared.registry.contains(&key) {
                continue;
            }
            let Some(mut task) = self.shared.repo.find(&key).await? else {
                continue;
            };
            mark_interrupted(&mut task, now);
            self.shared.repo.upsert(&task).await?;
            tracing::warn!(task = %key, "marked interrupted task as failed");
            recovered.push(key);
        }
        Ok(recovered)
    }
}

const INTERRUPTED: &str = "interrupted by engine restart";

fn mark_interrupted(task: &mut Task, now: DateTime<Utc>) {
    for stage in task.stages.iter_mut() {
        for job in stage.jobs.iter_mut().filter(|j| j.status.is_in_flight()) {
            job.status = Status::Failed;
            job.ended_at = Some(now);
            job.error = Some(INTERRUPTED.to_string());
        }
        if !stage.status.is_terminal() && stage.status != Status::Created {
            stage.status = Status::Failed;
            stage.ended_at = Some(now);
            stage.error = Some(INTERRUPTED.to_string());
        }
    }
    task.status = Status::Failed;
    task.ended_at = Some(now);
    task.error = Some(INTERRUPTED.to_string());
}
