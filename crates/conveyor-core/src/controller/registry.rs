//! Live task registry.
//!
//! Every task the controller is currently driving has exactly one
//! [`LiveTask`] entry: the authoritative in-memory copy of the task behind a
//! single async mutex, its cancellation token, and the wake-up used to
//! deliver approval decisions to the driver. The entry is removed when the
//! driver finishes.
//!
//! Writes to the task store go through [`LiveTask::flush`], which stamps each
//! snapshot with a revision so a slow background write can never overwrite
//! a newer state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use conveyor_types::error::RepositoryError;
use conveyor_types::task::{Task, TaskKey};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

use crate::repository::task::TaskRepository;

// ---------------------------------------------------------------------------
// LiveTask
// ---------------------------------------------------------------------------

pub(crate) struct LiveTask {
    key: TaskKey,
    state: Mutex<Task>,
    cancel: CancellationToken,
    wake: Notify,
    revision: AtomicU64,
    persisted: Mutex<u64>,
}

impl LiveTask {
    fn new(task: Task) -> Self {
        Self {
            key: task.key(),
            state: Mutex::new(task),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            revision: AtomicU64::new(0),
            persisted: Mutex::new(0),
        }
    }

    pub(crate) fn key(&self) -> &TaskKey {
        &self.key
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Task> {
        self.state.lock().await
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wake the driver if it is waiting on an approval gate.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Reserve a revision for a snapshot taken under the task lock.
    pub(crate) fn stamp(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Persist `snapshot` unless a newer revision has already been written.
    ///
    /// Returns whether the snapshot was written.
    pub(crate) async fn flush<R: TaskRepository>(
        &self,
        repo: &R,
        revision: u64,
        snapshot: &Task,
    ) -> Result<bool, RepositoryError> {
        let mut persisted = self.persisted.lock().await;
        if revision <= *persisted {
            tracing::debug!(task = %self.key, revision, persisted = *persisted, "skipping stale snapshot");
            return Ok(false);
        }
        repo.upsert(snapshot).await?;
        *persisted = revision;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// Concurrent map of live tasks keyed by `(workflow_name, task_id)`.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    tasks: DashMap<TaskKey, Arc<LiveTask>>,
}

impl TaskRegistry {
    /// Register a task. Returns `None` if the key is already live.
    pub(crate) fn insert(&self, task: Task) -> Option<Arc<LiveTask>> {
        match self.tasks.entry(task.key()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let live = Arc::new(LiveTask::new(task));
                slot.insert(live.clone());
                Some(live)
            }
        }
    }

    pub(crate) fn get(&self, key: &TaskKey) -> Option<Arc<LiveTask>> {
        self.tasks.get(key).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, key: &TaskKey) {
        self.tasks.remove(key);
    }

    pub(crate) fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub(crate) fn keys(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::status::Status;
    use conveyor_types::task::TaskFilter;

    use crate::testing::{MemoryTaskRepository, sample_task};

    #[test]
    fn insert_refuses_duplicate_keys() {
        let registry = TaskRegistry::default();
        assert!(registry.insert(sample_task("release", 1)).is_some());
        assert!(registry.insert(sample_task("release", 1)).is_none());
        assert!(registry.insert(sample_task("release", 2)).is_some());
        assert_eq!(
            registry.keys(),
            vec![TaskKey::new("release", 1), TaskKey::new("release", 2)]
        );
    }

    #[test]
    fn remove_forgets_task() {
        let registry = TaskRegistry::default();
        registry.insert(sample_task("release", 1));
        let key = TaskKey::new("release", 1);
        assert!(registry.contains(&key));
        registry.remove(&key);
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test]
    async fn stale_snapshots_are_never_written() {
        let repo = MemoryTaskRepository::default();
        let registry = TaskRegistry::default();
        let live = registry.insert(sample_task("release", 1)).unwrap();

        let (old_rev, old) = {
            let task = live.lock().await;
            (live.stamp(), task.clone())
        };
        let (new_rev, new) = {
            let mut task = live.lock().await;
            task.status = Status::Passed;
            (live.stamp(), task.clone())
        };

        assert!(live.flush(&repo, new_rev, &new).await.unwrap());
        assert!(!live.flush(&repo, old_rev, &old).await.unwrap());

        let stored = repo.find(live.key()).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Passed);
        assert_eq!(repo.list_by_filter(&TaskFilter::default()).await.unwrap().1, 1);
    }

    #[tokio::test]
    async fn wake_before_wait_is_not_lost() {
        let registry = TaskRegistry::default();
        let live = registry.insert(sample_task("release", 1)).unwrap();
        live.wake();
        tokio::time::timeout(std::time::Duration::from_secs(1), live.woken())
            .await
            .unwrap();
    }
}
