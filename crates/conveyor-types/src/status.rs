//! Execution status shared by tasks, stages and jobs.
//!
//! The same status vocabulary is used at every level of a task so that a
//! task's status can mirror the stage that decided it, and a stage's status
//! can mirror the job that failed it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task, stage or job.
///
/// Non-terminal statuses move forward only:
/// `created -> pending -> prepare -> running -> debug_before/debug_after -> terminal`.
/// `pending` is reserved for a stage blocked on its approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Created,
    Pending,
    Prepare,
    Running,
    DebugBefore,
    DebugAfter,
    Passed,
    Failed,
    Timeout,
    Cancelled,
    Reject,
}

impl Status {
    /// All statuses, in lifecycle order.
    pub const ALL: [Status; 11] = [
        Status::Created,
        Status::Pending,
        Status::Prepare,
        Status::Running,
        Status::DebugBefore,
        Status::DebugAfter,
        Status::Passed,
        Status::Failed,
        Status::Timeout,
        Status::Cancelled,
        Status::Reject,
    ];

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Passed | Status::Failed | Status::Timeout | Status::Cancelled | Status::Reject
        )
    }

    /// Whether the job is paused at a breakpoint.
    pub fn is_debug(&self) -> bool {
        matches!(self, Status::DebugBefore | Status::DebugAfter)
    }

    /// Terminal statuses from which a task may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Timeout | Status::Cancelled | Status::Reject
        )
    }

    /// Whether a job in this status has been handed to the execution backend
    /// and has not yet finished.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Status::Prepare | Status::Running | Status::DebugBefore | Status::DebugAfter
        )
    }

    /// Stable snake_case identifier, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Pending => "pending",
            Status::Prepare => "prepare",
            Status::Running => "running",
            Status::DebugBefore => "debug_before",
            Status::DebugAfter => "debug_after",
            Status::Passed => "passed",
            Status::Failed => "failed",
            Status::Timeout => "timeout",
            Status::Cancelled => "cancelled",
            Status::Reject => "reject",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}
