//! Event types for the task engine event bus.
//!
//! `TaskEvent` is broadcast on every lifecycle transition the controller
//! acknowledges. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};

use crate::status::Status;
use crate::task::{ApprovalStatus, TaskKey};

/// Which side of the user shell step a breakpoint pauses on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointPosition {
    Before,
    After,
}

impl BreakpointPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakpointPosition::Before => "before",
            BreakpointPosition::After => "after",
        }
    }
}

impl std::fmt::Display for BreakpointPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted while tasks are instantiated and driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was instantiated and persisted in `created`.
    TaskCreated { key: TaskKey, creator: String },

    /// The controller began (or resumed) driving a task.
    TaskStarted { key: TaskKey, is_restart: bool },

    /// A stage changed status.
    StageChanged {
        key: TaskKey,
        stage: String,
        status: Status,
    },

    /// An approval gate changed status.
    ApprovalChanged {
        key: TaskKey,
        stage: String,
        status: ApprovalStatus,
    },

    /// A job task changed status.
    JobChanged {
        key: TaskKey,
        job: String,
        status: Status,
    },

    /// A breakpoint flag was set or cleared, or a paused job was released.
    Breakpoint {
        key: TaskKey,
        job: String,
        position: BreakpointPosition,
        set: bool,
    },

    /// Cancellation was requested.
    TaskCancelled { key: TaskKey, revoker: String },

    /// The task reached a terminal status and left the live registry.
    TaskFinished { key: TaskKey, status: Status },
}

impl TaskEvent {
    pub fn key(&self) -> &TaskKey {
        match self {
            TaskEvent::TaskCreated { key, .. }
            | TaskEvent::TaskStarted { key, .. }
            | TaskEvent::StageChanged { key, .. }
            | TaskEvent::ApprovalChanged { key, .. }
            | TaskEvent::JobChanged { key, .. }
            | TaskEvent::Breakpoint { key, .. }
            | TaskEvent::TaskCancelled { key, .. }
            | TaskEvent::TaskFinished { key, .. } => key,
        }
    }
}
