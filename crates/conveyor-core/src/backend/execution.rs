//! Job execution dispatcher port.

use std::collections::BTreeMap;

use conveyor_types::status::Status;
use conveyor_types::task::{ExecutionHandle, JobTask, TaskKey};

use super::BackendError;

/// Point-in-time status of an execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub status: Status,
    /// Outputs published by the job, available once it passed.
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl JobReport {
    pub fn running() -> Self {
        Self::with_status(Status::Running)
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            outputs: BTreeMap::new(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            outputs: BTreeMap::new(),
            error: Some(error.into()),
        }
    }
}

/// Runs job tasks on external compute.
///
/// The backend reports `debug_before`/`debug_after` while a unit is paused
/// at a breakpoint, and a terminal status once the unit exits. Cancellation
/// is a request: the terminal status still arrives through [`status`].
///
/// [`status`]: ExecutionBackend::status
pub trait ExecutionBackend: Send + Sync {
    /// Create an execution unit for the job and return its handle.
    fn submit(
        &self,
        task: &TaskKey,
        job: &JobTask,
    ) -> impl std::future::Future<Output = Result<ExecutionHandle, BackendError>> + Send;

    fn status(
        &self,
        handle: &ExecutionHandle,
    ) -> impl std::future::Future<Output = Result<JobReport, BackendError>> + Send;

    fn cancel(
        &self,
        handle: &ExecutionHandle,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}

/// Backend for processes that manage stored tasks without running jobs.
/// Every submission is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedBackend;

impl ExecutionBackend for DetachedBackend {
    async fn submit(&self, task: &TaskKey, job: &JobTask) -> Result<ExecutionHandle, BackendError> {
        Err(BackendError::Rejected(format!(
            "no execution backend attached, cannot run {} of {task}",
            job.name
        )))
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<JobReport, BackendError> {
        Err(BackendError::UnitNotFound(handle.unit.clone()))
    }

    async fn cancel(&self, _handle: &ExecutionHandle) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_task;

    #[tokio::test]
    async fn detached_backend_refuses_work() {
        let task = sample_task("release", 1);
        let job = &task.stages[0].jobs[0];
        let err = DetachedBackend.submit(&task.key(), job).await.unwrap_err();
        assert!(err.to_string().contains("cannot run compile of release"), "{err}");
    }
}
