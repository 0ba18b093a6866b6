//! Breakpoint control for live tasks in debug mode.
//!
//! Setting a breakpoint probes the unit and writes the marker while the task
//! lock is held, so a job cannot progress past the pause point between the
//! check and the write. Each remote call is bounded by the controller's
//! remote timeout. Releasing a breakpoint runs its remote calls without the
//! lock and re-takes it only to record the result.

use std::future::Future;
use std::time::Duration;

use conveyor_types::definition::JobType;
use conveyor_types::event::{BreakpointPosition, TaskEvent};
use conveyor_types::status::Status;
use conveyor_types::task::{ExecutionHandle, TaskKey};
use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::debug::{DebugChannel, DebugMarker};
use crate::backend::execution::ExecutionBackend;
use crate::backend::notify::Notifier;
use crate::repository::task::TaskRepository;

use super::{ControllerError, TaskController};

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("task is not in debug mode")]
    DebugDisabled,

    #[error("task is already in debug mode")]
    AlreadyDebug,

    #[error("{0} jobs do not support breakpoints")]
    Unsupported(JobType),

    #[error("job '{job}' is '{status}', breakpoints cannot be changed")]
    InvalidJobState { job: String, status: Status },

    #[error("job '{0}' has no execution unit yet")]
    NotScheduled(String),

    #[error("job '{0}' has already started its script, the before breakpoint cannot change")]
    StepAlreadyStarted(String),

    #[error("job '{0}' has already finished its script, the after breakpoint cannot change")]
    StepAlreadyDone(String),

    #[error("job '{job}' is not paused at its {position} breakpoint")]
    BreakpointNotReached { job: String, position: BreakpointPosition },

    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Remote(#[from] BackendError),
}

fn guard_marker(position: BreakpointPosition) -> DebugMarker {
    match position {
        BreakpointPosition::Before => DebugMarker::StepStarted,
        BreakpointPosition::After => DebugMarker::StepDone,
    }
}

impl<R, B, D, N> TaskController<R, B, D, N>
where
    R: TaskRepository + 'static,
    B: ExecutionBackend + 'static,
    D: DebugChannel + 'static,
    N: Notifier + 'static,
{
    /// Turn debug mode on for a live task. Jobs that start afterwards may be
    /// paused; jobs already running are unaffected until a breakpoint is set.
    pub async fn enable_debug(&self, key: &TaskKey) -> Result<(), ControllerError> {
        let live = self.live(key)?;
        let mut task = live.lock().await;
        if task.status.is_terminal() {
            return Err(ControllerError::NotLive(key.clone()));
        }
        if task.debug {
            return Err(DebugError::AlreadyDebug.into());
        }
        let mut updated = task.clone();
        updated.debug = true;
        self.shared.commit(&live, &mut task, updated).await?;
        tracing::info!(task = %key, "debug mode enabled");
        Ok(())
    }

    /// Set or unset a job's breakpoint.
    ///
    /// A job that has not started only has its flag changed. For a job whose
    /// unit is alive, the step marker guarding `position` is probed first and
    /// the change is refused once the script has passed that point.
    pub async fn set_breakpoint(
        &self,
        key: &TaskKey,
        job_name: &str,
        position: BreakpointPosition,
        set: bool,
    ) -> Result<(), ControllerError> {
        let live = self.live(key)?;
        let mut task = live.lock().await;
        if task.status.is_terminal() {
            return Err(ControllerError::NotLive(key.clone()));
        }
        if !task.debug {
            return Err(DebugError::DebugDisabled.into());
        }
        let job = task
            .job(job_name)
            .ok_or_else(|| ControllerError::JobNotFound {
                key: key.clone(),
                job: job_name.to_string(),
            })?;
        let job_type = job.job_type();
        if !job_type.supports_debug() {
            return Err(DebugError::Unsupported(job_type).into());
        }

        match (job.status, job.execution.clone()) {
            (Status::Created, _) => {}
            (Status::Prepare | Status::Running | Status::DebugBefore, Some(handle)) => {
                self.write_marker(&handle, job_name, position, set).await?;
            }
            (Status::Prepare, None) => {
                return Err(DebugError::NotScheduled(job_name.to_string()).into());
            }
            (status, _) => {
                return Err(DebugError::InvalidJobState {
                    job: job_name.to_string(),
                    status,
                }
                .into());
            }
        }

        let mut updated = task.clone();
        if let Some(job) = updated.job_mut(job_name) {
            match position {
                BreakpointPosition::Before => job.breakpoint_before = set,
                BreakpointPosition::After => job.breakpoint_after = set,
            }
        }
        self.shared.commit(&live, &mut task, updated).await?;
        drop(task);

        tracing::info!(task = %key, job = job_name, %position, set, "breakpoint updated");
        self.shared.publish(TaskEvent::Breakpoint {
            key: key.clone(),
            job: job_name.to_string(),
            position,
            set,
        });
        Ok(())
    }

    /// Resume a job paused at `position`.
    ///
    /// Fails if the breakpoint marker is absent on the unit.
    pub async fn release_breakpoint(
        &self,
        key: &TaskKey,
        job_name: &str,
        position: BreakpointPosition,
    ) -> Result<(), ControllerError> {
        let live = self.live(key)?;
        let handle = {
            let task = live.lock().await;
            if task.status.is_terminal() {
                return Err(ControllerError::NotLive(key.clone()));
            }
            if !task.debug {
                return Err(DebugError::DebugDisabled.into());
            }
            let job = task
                .job(job_name)
                .ok_or_else(|| ControllerError::JobNotFound {
                    key: key.clone(),
                    job: job_name.to_string(),
                })?;
            if !job.status.is_in_flight() {
                return Err(DebugError::InvalidJobState {
                    job: job_name.to_string(),
                    status: job.status,
                }
                .into());
            }
            job.execution
                .clone()
                .ok_or_else(|| DebugError::NotScheduled(job_name.to_string()))?
        };

        let marker = DebugMarker::Breakpoint(position);
        if !self.remote(self.shared.debug.probe(&handle, marker)).await? {
            return Err(DebugError::BreakpointNotReached {
                job: job_name.to_string(),
                position,
            }
            .into());
        }
        self.remote(self.shared.debug.clear(&handle, marker)).await?;

        {
            let mut task = live.lock().await;
            let mut updated = task.clone();
            if let Some(job) = updated.job_mut(job_name) {
                match position {
                    BreakpointPosition::Before => job.breakpoint_before = false,
                    BreakpointPosition::After => job.breakpoint_after = false,
                }
            }
            self.shared.commit(&live, &mut task, updated).await?;
        }

        tracing::info!(task = %key, job = job_name, %position, "breakpoint released");
        self.shared.publish(TaskEvent::Breakpoint {
            key: key.clone(),
            job: job_name.to_string(),
            position,
            set: false,
        });
        Ok(())
    }

    async fn write_marker(
        &self,
        handle: &ExecutionHandle,
        job_name: &str,
        position: BreakpointPosition,
        set: bool,
    ) -> Result<(), DebugError> {
        let guard = guard_marker(position);
        if self.remote(self.shared.debug.probe(handle, guard)).await? {
            return Err(match position {
                BreakpointPosition::Before => DebugError::StepAlreadyStarted(job_name.to_string()),
                BreakpointPosition::After => DebugError::StepAlreadyDone(job_name.to_string()),
            });
        }

        let marker = DebugMarker::Breakpoint(position);
        if set {
            self.remote(self.shared.debug.set(handle, marker)).await
        } else {
            self.remote(self.shared.debug.clear(handle, marker)).await
        }
    }

    async fn remote<T>(
        &self,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, DebugError> {
        let limit = self.shared.settings.remote_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(|e| {
                tracing::warn!("debug channel call failed: {e}");
                DebugError::Remote(e)
            }),
            Err(_) => Err(DebugError::Timeout(limit)),
        }
    }
}
