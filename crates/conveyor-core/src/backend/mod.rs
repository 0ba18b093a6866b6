//! Ports to the systems that actually run jobs.
//!
//! The engine never creates pods or shells out itself. It hands job tasks to
//! an [`execution::ExecutionBackend`], talks to a running unit through a
//! [`debug::DebugChannel`], and reports outcomes through a
//! [`notify::Notifier`].

pub mod debug;
pub mod execution;
pub mod notify;
pub mod remote;

use thiserror::Error;

/// Errors surfaced by backend adapters.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("execution unit not found: {0}")]
    UnitNotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}
