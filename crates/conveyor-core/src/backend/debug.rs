//! Debug channel into a running execution unit.
//!
//! A unit that supports debugging exposes three markers: "shell step
//! started", "shell step done", and one breakpoint marker per position.
//! The unit creates the step markers itself and pauses while a breakpoint
//! marker exists. The engine only probes, sets and clears them.

use conveyor_types::event::BreakpointPosition;
use conveyor_types::task::ExecutionHandle;

use super::BackendError;
use super::remote::RemoteCommand;

/// A marker inside an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugMarker {
    StepStarted,
    StepDone,
    Breakpoint(BreakpointPosition),
}

/// Probe/set/clear access to the debug markers of a unit.
pub trait DebugChannel: Send + Sync {
    /// Whether the marker currently exists.
    fn probe(
        &self,
        handle: &ExecutionHandle,
        marker: DebugMarker,
    ) -> impl std::future::Future<Output = Result<bool, BackendError>> + Send;

    fn set(
        &self,
        handle: &ExecutionHandle,
        marker: DebugMarker,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    /// Remove the marker. Clearing an absent marker succeeds.
    fn clear(
        &self,
        handle: &ExecutionHandle,
        marker: DebugMarker,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}

// ---------------------------------------------------------------------------
// Sentinel files
// ---------------------------------------------------------------------------

/// [`DebugChannel`] backed by sentinel files, driven through a
/// [`RemoteCommand`] with `test -e`, `touch` and `rm -f`.
///
/// Removal uses `rm -f` rather than plain `rm` so that clearing a marker
/// that is already gone succeeds, as [`DebugChannel::clear`] requires.
///
/// A probe that fails with output on stderr is a transport error (the pod
/// could not be reached) and is returned as such. `test -e` itself exits
/// non-zero silently when the marker is absent.
pub struct SentinelDebugChannel<X> {
    remote: X,
    marker_dir: String,
}

impl<X: RemoteCommand> SentinelDebugChannel<X> {
    pub fn new(remote: X, marker_dir: impl Into<String>) -> Self {
        let marker_dir: String = marker_dir.into();
        Self {
            remote,
            marker_dir: marker_dir.trim_end_matches('/').to_string(),
        }
    }

    /// Absolute path of the sentinel file for a marker.
    pub fn path(&self, marker: DebugMarker) -> String {
        match marker {
            DebugMarker::StepStarted => format!("{}/shell_step", self.marker_dir),
            DebugMarker::StepDone => format!("{}/shell_step_done", self.marker_dir),
            DebugMarker::Breakpoint(position) => {
                format!("{}/breakpoint_{position}", self.marker_dir)
            }
        }
    }

    async fn run(&self, handle: &ExecutionHandle, command: String) -> Result<(), BackendError> {
        let output = self.remote.exec(handle, &command).await?;
        if output.success {
            Ok(())
        } else {
            Err(BackendError::CommandFailed {
                command,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

impl<X: RemoteCommand> DebugChannel for SentinelDebugChannel<X> {
    async fn probe(&self, handle: &ExecutionHandle, marker: DebugMarker) -> Result<bool, BackendError> {
        let command = format!("test -e '{}'", self.path(marker));
        let output = self.remote.exec(handle, &command).await?;
        let stderr = output.stderr.trim();
        if !output.success && !stderr.is_empty() {
            return Err(BackendError::CommandFailed {
                command,
                stderr: stderr.to_string(),
            });
        }
        tracing::debug!(unit = handle.unit.as_str(), command = command.as_str(), present = output.success, "probed debug marker");
        Ok(output.success)
    }

    async fn set(&self, handle: &ExecutionHandle, marker: DebugMarker) -> Result<(), BackendError> {
        self.run(handle, format!("touch '{}'", self.path(marker))).await
    }

    async fn clear(&self, handle: &ExecutionHandle, marker: DebugMarker) -> Result<(), BackendError> {
        self.run(handle, format!("rm -f '{}'", self.path(marker))).await
    }
}
