//! Task repository trait definition.
//!
//! The task store is the durable record of every task instance and the
//! owner of the per-workflow sequence counters. The infrastructure layer
//! (conveyor-infra) implements this trait with SQLite persistence.

use conveyor_types::error::RepositoryError;
use conveyor_types::task::{Task, TaskFilter, TaskKey, TaskSummary};

/// Repository trait for task persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskRepository: Send + Sync {
    /// Load a task by workflow name and sequence number.
    fn find(
        &self,
        key: &TaskKey,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// Insert or replace the full task document keyed by `(workflow_name, task_id)`.
    fn upsert(
        &self,
        task: &Task,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Page through task summaries, newest first, with the total match count.
    fn list_by_filter(
        &self,
        filter: &TaskFilter,
    ) -> impl std::future::Future<Output = Result<(Vec<TaskSummary>, u64), RepositoryError>> + Send;

    /// Tasks whose stored status is not terminal.
    fn list_unfinished(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<TaskSummary>, RepositoryError>> + Send;

    /// Atomically increment and return the workflow's sequence counter.
    ///
    /// The first call for a workflow returns 1. Concurrent callers, including
    /// callers in other processes sharing the store, never observe the same
    /// value.
    fn next_sequence(
        &self,
        workflow_name: &str,
    ) -> impl std::future::Future<Output = Result<i64, RepositoryError>> + Send;
}
