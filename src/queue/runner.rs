//! TaskRunner: bridges blocking executors into the async queue.
//!
//! Admission takes a semaphore slot and then a guarded store transition;
//! only when both succeed does the executor run, on a blocking worker
//! thread. A supervision task owns the slot for the whole run, relays
//! progress into the store, and writes the terminal status when the
//! executor yields. Cancellation only signals a token; the slot stays
//! taken until the executor actually returns.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result, TaskError};
use crate::queue::executor::{JobExecutor, ProgressReporter};
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};

/// Tracked in-flight task.
struct InFlightTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// How a run ended, before the terminal status write.
enum RunOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

/// Runs admitted tasks on blocking worker threads under a concurrency cap.
pub struct TaskRunner {
    config: QueueConfig,
    store: Arc<TaskStore>,
    slots: Arc<Semaphore>,
    /// Tracked in-flight tasks (for cancellation and status queries).
    running: Arc<RwLock<HashMap<Uuid, InFlightTask>>>,
    /// Parent of every per-task token; fired on shutdown.
    root_cancel: CancellationToken,
}

impl TaskRunner {
    /// Create a new runner with `config.max_running` worker slots.
    pub fn new(config: QueueConfig, store: Arc<TaskStore>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_running));
        Self {
            config,
            store,
            slots,
            running: Arc::new(RwLock::new(HashMap::new())),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Admit a pending task into a worker slot and run it.
    ///
    /// Fails fast with `ConcurrencyLimit` when every slot is taken. The
    /// store arbitrates the rest: the task must still be pending and the
    /// persisted running count must sit under the cap (rows left running
    /// by an unclean shutdown count too, until recovered).
    pub async fn spawn(&self, task: &Task, executor: Arc<dyn JobExecutor>) -> Result<()> {
        let task_id = task.task_id;

        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(TaskError::ConcurrencyLimit {
                    max: self.config.max_running,
                }
                .into());
            }
        };

        if !self
            .store
            .mark_running(task_id, self.config.max_running)
            .await?
        {
            drop(permit);
            return Err(self.refusal(task_id).await);
        }

        let cancel = self.root_cancel.child_token();
        let (progress_tx, progress_rx) = watch::channel(None);
        let reporter = ProgressReporter::new(progress_tx);

        let exec_params = task.params.clone();
        let exec_cancel = cancel.clone();
        let supervise_cancel = cancel.clone();
        let store = Arc::clone(&self.store);
        let relay_store = Arc::clone(&self.store);
        let config = self.config.clone();
        let running_map = Arc::clone(&self.running);

        // Relay each observed progress update into the store. The watch
        // channel keeps only the newest unseen value, so a slow store sees
        // the latest report rather than a growing backlog.
        let relay = tokio::spawn(async move {
            let mut rx = progress_rx;
            while rx.changed().await.is_ok() {
                let update = match rx.borrow_and_update().clone() {
                    Some(update) => update,
                    None => continue,
                };
                let applied = relay_store
                    .record_progress(
                        task_id,
                        update.percentage(),
                        update.total,
                        update.current_item.as_deref(),
                    )
                    .await;
                match applied {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(task_id = %task_id, "Progress update after task settled, dropped")
                    }
                    Err(e) => warn!(task_id = %task_id, "Failed to persist progress: {e}"),
                }
            }
        });

        // Hold the map lock across the spawn so the supervision task cannot
        // remove its entry before it has been inserted.
        let mut running = self.running.write().await;
        let handle = tokio::spawn(async move {
            let join =
                tokio::task::spawn_blocking(move || executor.run(exec_params, reporter, exec_cancel))
                    .await;

            // Returning from the job body dropped the reporter, so the
            // relay drains the final update and exits.
            let _ = relay.await;

            let outcome = match join {
                Ok(Ok(result)) => RunOutcome::Completed(result),
                Ok(Err(e)) => RunOutcome::Failed(format!("{e:#}")),
                Err(e) => RunOutcome::Failed(format!("Executor crashed: {e}")),
            };

            write_terminal(
                &store,
                &config,
                task_id,
                supervise_cancel.is_cancelled(),
                outcome,
            )
            .await;

            running_map.write().await.remove(&task_id);
            drop(permit);
        });
        running.insert(task_id, InFlightTask { cancel, handle });
        drop(running);

        info!(task_id = %task_id, "Task started");
        Ok(())
    }

    /// Work out why the store refused to mark a task running.
    async fn refusal(&self, task_id: Uuid) -> Error {
        match self.store.get(task_id).await {
            Ok(None) => TaskError::NotFound { id: task_id }.into(),
            Ok(Some(task)) if task.status != TaskStatus::Pending => TaskError::InvalidState {
                id: task_id,
                status: task.status.to_string(),
            }
            .into(),
            // Still pending, so the persisted running count is at the cap.
            Ok(Some(_)) => TaskError::ConcurrencyLimit {
                max: self.config.max_running,
            }
            .into(),
            Err(e) => e.into(),
        }
    }

    /// Fire the cancellation token of a tracked task. Returns whether a
    /// token was there to fire.
    pub async fn signal_cancel(&self, task_id: Uuid) -> bool {
        let running = self.running.read().await;
        match running.get(&task_id) {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                debug!(task_id = %task_id, "Cancellation signalled");
                true
            }
            None => false,
        }
    }

    /// Check if a task has a live in-flight handle.
    pub async fn is_tracked(&self, task_id: Uuid) -> bool {
        self.running.read().await.contains_key(&task_id)
    }

    /// Number of tasks currently holding a worker slot.
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Cancel every in-flight task and wait for their supervision tasks
    /// to settle the rows. Cooperative: executors run until their next
    /// cancellation checkpoint.
    pub async fn shutdown(&self) {
        self.root_cancel.cancel();

        let handles: Vec<(Uuid, JoinHandle<()>)> = self
            .running
            .write()
            .await
            .drain()
            .map(|(task_id, in_flight)| (task_id, in_flight.handle))
            .collect();

        for (task_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(task_id = %task_id, "Supervision task failed during shutdown: {e}");
            }
        }
    }
}

/// Write the terminal status for a finished run, retrying transient
/// storage failures a bounded number of times. A cancelled run settles as
/// cancelled regardless of what the executor returned.
async fn write_terminal(
    store: &TaskStore,
    config: &QueueConfig,
    task_id: Uuid,
    cancelled: bool,
    outcome: RunOutcome,
) {
    for attempt in 1..=config.terminal_write_attempts {
        let written = if cancelled {
            store.cancel_running(task_id).await
        } else {
            match &outcome {
                RunOutcome::Completed(result) => store.complete(task_id, result).await,
                RunOutcome::Failed(message) => store.fail(task_id, message).await,
            }
        };

        match written {
            Ok(true) => {
                if cancelled {
                    info!(task_id = %task_id, "Task cancelled");
                } else {
                    match &outcome {
                        RunOutcome::Completed(_) => info!(task_id = %task_id, "Task completed"),
                        RunOutcome::Failed(message) => {
                            warn!(task_id = %task_id, "Task failed: {message}")
                        }
                    }
                }
                return;
            }
            Ok(false) => {
                // Another writer settled the row first (normally a cancel).
                debug!(task_id = %task_id, "Task already settled, terminal write skipped");
                return;
            }
            Err(e) => {
                if attempt < config.terminal_write_attempts {
                    warn!(task_id = %task_id, attempt, "Terminal status write failed, retrying: {e}");
                    tokio::time::sleep(config.terminal_write_backoff).await;
                } else {
                    error!(
                        task_id = %task_id,
                        attempts = config.terminal_write_attempts,
                        "Giving up on terminal status write, task left running: {e}"
                    );
                }
            }
        }
    }
}
