//! TaskQueue: the coordinator callers talk to.
//!
//! Owns the store, the runner and the executor registry. Admission
//! (dedup on the canonical target key), lifecycle transitions and
//! recovery all go through here; execution itself is the runner's job.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result, StorageError, TaskError};
use crate::queue::executor::JobExecutor;
use crate::queue::runner::TaskRunner;
use crate::store::{Database, TaskStore};
use crate::task::{Task, TaskStatus, TaskSummary, TaskType, canonical_target_key};

/// Coordinates task admission, execution and cancellation over a shared
/// task store.
pub struct TaskQueue {
    config: QueueConfig,
    store: Arc<TaskStore>,
    runner: TaskRunner,
    executors: RwLock<HashMap<TaskType, Arc<dyn JobExecutor>>>,
}

impl TaskQueue {
    /// Create a queue over an opened database.
    pub fn new(db: Arc<Database>, config: QueueConfig) -> Self {
        let store = Arc::new(TaskStore::new(db));
        let runner = TaskRunner::new(config.clone(), Arc::clone(&store));
        Self {
            config,
            store,
            runner,
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Register the executor for a task type, replacing any previous one.
    pub async fn register_executor(&self, task_type: TaskType, executor: Arc<dyn JobExecutor>) {
        self.executors.write().await.insert(task_type, executor);
    }

    /// Admit a new task.
    ///
    /// `params` must carry a non-empty `target_key` string; the key is
    /// canonicalized and at most one non-terminal task may hold it at a
    /// time. Returns the id of the persisted task.
    pub async fn create_task(
        &self,
        task_type: TaskType,
        params: serde_json::Value,
    ) -> Result<Uuid> {
        let target_key = params
            .get("target_key")
            .and_then(|v| v.as_str())
            .ok_or(TaskError::MissingTargetKey)?;
        let canonical_key = canonical_target_key(target_key);
        if canonical_key.is_empty() {
            return Err(TaskError::MissingTargetKey.into());
        }

        if let Some(conflict) = self.store.find_conflicting(&canonical_key).await? {
            return Err(duplicate_error(&canonical_key, &conflict));
        }

        let task = Task::new(task_type, params, canonical_key.clone());
        let task_id = task.task_id;
        match self.store.insert(&task).await {
            Ok(()) => {}
            // Lost the admission race: another creator claimed the key
            // between our check and our insert.
            Err(StorageError::Constraint(_)) => {
                if let Some(conflict) = self.store.find_conflicting(&canonical_key).await? {
                    return Err(duplicate_error(&canonical_key, &conflict));
                }
                // The winner settled already; the key is free again.
                self.store.insert(&task).await?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(task_id = %task_id, target = %canonical_key, "Task created");
        Ok(task_id)
    }

    /// Start a pending task on its registered executor.
    pub async fn start_task(&self, task_id: Uuid) -> Result<()> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        if !task.status.can_transition_to(TaskStatus::Running) {
            return Err(TaskError::InvalidState {
                id: task_id,
                status: task.status.to_string(),
            }
            .into());
        }

        let executor = {
            let executors = self.executors.read().await;
            executors.get(&task.task_type).cloned()
        }
        .ok_or_else(|| TaskError::UnknownTaskType {
            task_type: task.task_type.to_string(),
        })?;

        self.runner.spawn(&task, executor).await
    }

    /// Fetch the full task record.
    pub async fn get_status(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id: task_id }.into())
    }

    /// List task summaries, newest first, optionally filtered by status.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskSummary>> {
        Ok(self.store.list(status, limit).await?)
    }

    /// Cancel a task. Idempotent: cancelling a settled task is a no-op.
    ///
    /// A pending task settles immediately. A running task is settled in
    /// the store first, then its executor is signalled; the worker slot
    /// stays taken until the executor reaches a cancellation checkpoint
    /// and returns.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            debug!(task_id = %task_id, status = %task.status, "Cancel requested for settled task");
            return Ok(());
        }

        if task.status == TaskStatus::Pending {
            if self.store.cancel_pending(task_id).await? {
                info!(task_id = %task_id, "Pending task cancelled");
                return Ok(());
            }
            // The task moved under us. If it settled we are done; if it
            // started running, fall through to the running path.
            match self.store.get(task_id).await? {
                Some(current) if current.status == TaskStatus::Running => {}
                _ => return Ok(()),
            }
        }

        self.cancel_running_task(task_id).await
    }

    /// Settle a running task as cancelled and signal its executor.
    async fn cancel_running_task(&self, task_id: Uuid) -> Result<()> {
        if !self.runner.signal_cancel(task_id).await {
            // No in-flight executor: a stale row from an earlier process,
            // or a run settling right now. The status write arbitrates.
            warn!(task_id = %task_id, "Cancel requested for untracked running task");
        }

        for attempt in 1..=self.config.terminal_write_attempts {
            match self.store.cancel_running(task_id).await {
                Ok(true) => {
                    info!(task_id = %task_id, "Task cancelled");
                    return Ok(());
                }
                Ok(false) => {
                    // Settled before our write; cancelling is idempotent.
                    debug!(task_id = %task_id, "Task settled before cancel write");
                    return Ok(());
                }
                Err(e) => {
                    if attempt < self.config.terminal_write_attempts {
                        warn!(task_id = %task_id, attempt, "Cancel write failed, retrying: {e}");
                        tokio::time::sleep(self.config.terminal_write_backoff).await;
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }
        // Only reachable when terminal_write_attempts is zero.
        Ok(())
    }

    /// All tasks that ever targeted a key, newest first.
    pub async fn task_history(&self, target_key: &str, limit: usize) -> Result<Vec<TaskSummary>> {
        let canonical_key = canonical_target_key(target_key);
        Ok(self.store.history_for_target(&canonical_key, limit).await?)
    }

    /// Fail rows left running by an unclean shutdown.
    ///
    /// A row is stale when it claims to be running but no executor in
    /// this process is tracked for it. Returns how many rows were
    /// recovered. Call once at startup, before accepting new work.
    pub async fn recover_stale_tasks(&self) -> Result<usize> {
        let mut recovered = 0;
        for task_id in self.store.running_ids().await? {
            if self.runner.is_tracked(task_id).await {
                continue;
            }
            if self
                .store
                .fail(task_id, "Interrupted by process restart")
                .await?
            {
                warn!(task_id = %task_id, "Recovered stale running task");
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Stale running tasks marked failed");
        }
        Ok(recovered)
    }

    /// Number of tasks currently holding a worker slot.
    pub async fn running_count(&self) -> usize {
        self.runner.running_count().await
    }

    /// Cancel all in-flight work and wait for it to settle.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }
}

fn duplicate_error(target_key: &str, conflict: &Task) -> Error {
    TaskError::Duplicate {
        target_key: target_key.to_string(),
        conflicting_task_id: conflict.task_id,
        conflicting_status: conflict.status.to_string(),
    }
    .into()
}
