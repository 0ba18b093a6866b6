//! Remote command execution port.

use conveyor_types::task::ExecutionHandle;

use super::BackendError;

/// Captured result of a remote shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a shell command inside a live execution unit.
pub trait RemoteCommand: Send + Sync {
    fn exec(
        &self,
        handle: &ExecutionHandle,
        command: &str,
    ) -> impl std::future::Future<Output = Result<ExecOutput, BackendError>> + Send;
}
