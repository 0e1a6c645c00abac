//! Returns failed tasks with retries left to the pending queue.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{TaskPatch, TaskStatus};
use crate::domain::ports::{PhaseHook, SchedulerStore, TaskFilter};

/// Default retry-queue phase: failed tasks with retries left go back to
/// `pending`. Cooldown is enforced later by the assignment engine.
pub struct RetryQueueSweep {
    store: Arc<dyn SchedulerStore>,
}

impl RetryQueueSweep {
    /// Sweep over `store`.
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self { store }
    }

    /// Requeue failed tasks with retries left. Returns how many moved.
    pub async fn sweep(&self) -> DomainResult<usize> {
        let mut requeued = 0;
        for task in self.store.get_tasks(TaskFilter::status(TaskStatus::Failed)).await? {
            if task.retries_exhausted() {
                continue;
            }
            let patch = match task.transition(TaskStatus::Pending) {
                Ok(patch) => patch.unassigned(),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "cannot requeue task");
                    continue;
                }
            };
            self.store.update_task(task.id, &patch).await?;
            debug!(task_id = %task.id, retry_count = task.retry_count, "failed task requeued");
            requeued += 1;
        }
        Ok(requeued)
    }
}

#[async_trait]
impl PhaseHook for RetryQueueSweep {
    async fn run(&self) -> DomainResult<()> {
        self.sweep().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryStore;
    use crate::domain::models::Task;

    #[tokio::test]
    async fn test_requeues_only_tasks_with_retries_left() {
        let store = Arc::new(InMemoryStore::new());
        let retryable = Task::new("TASK-1", "feature");
        let exhausted = Task::new("TASK-2", "feature");
        for (task, retries) in [(&retryable, 1), (&exhausted, 3)] {
            store.create_task(task).await.unwrap();
            store
                .update_task(
                    task.id,
                    &TaskPatch::status(TaskStatus::Failed).with_retry_count(retries),
                )
                .await
                .unwrap();
        }

        let sweep = RetryQueueSweep::new(store.clone());
        assert_eq!(sweep.sweep().await.unwrap(), 1);

        let retryable = store.get_task(retryable.id).await.unwrap().unwrap();
        assert_eq!(retryable.status, TaskStatus::Pending);
        assert_eq!(retryable.retry_count, 1);
        let exhausted = store.get_task(exhausted.id).await.unwrap().unwrap();
        assert_eq!(exhausted.status, TaskStatus::Failed);
    }
}
