//! TaskStore: CRUD and guarded status updates for queue tasks.
//!
//! Every status-changing statement carries its expected current status in
//! the WHERE clause and reports back whether a row actually changed. A
//! `false` return means another writer settled the row first, which
//! callers treat as losing a race, not as an error. Progress writes are
//! guarded the same way so a late update can never touch a row that has
//! already reached a terminal status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::params;
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;
use crate::task::{Task, TaskStatus, TaskSummary, TaskType};

use super::db::Database;

const TASK_COLUMNS: &str = "task_id, task_type, status, params, canonical_key, result, error_message, progress, total_items, current_item, created_at, started_at, completed_at";
const SUMMARY_COLUMNS: &str =
    "task_id, task_type, status, progress, total_items, created_at, started_at, completed_at";

/// Persistent task storage.
pub struct TaskStore {
    db: Arc<Database>,
}

impl TaskStore {
    /// Create a new TaskStore wrapping the given database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a newly admitted task.
    ///
    /// A unique violation on the active-target index surfaces as
    /// `StorageError::Constraint`, which the admission layer turns into a
    /// duplicate-task error.
    pub async fn insert(&self, task: &Task) -> Result<(), StorageError> {
        let conn = self.db.conn();
        let params_str = serde_json::to_string(&task.params)
            .map_err(|e| StorageError::Serialization(format!("task params: {e}")))?;
        let result_str = match &task.result {
            Some(v) => Some(
                serde_json::to_string(v)
                    .map_err(|e| StorageError::Serialization(format!("task result: {e}")))?,
            ),
            None => None,
        };

        conn.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                task.task_id.to_string(),
                task.task_type.as_str(),
                task.status.as_str(),
                params_str,
                task.canonical_key.as_str(),
                opt_text_owned(result_str),
                opt_text(task.error_message.as_deref()),
                task.progress as i64,
                task.total_items,
                opt_text(task.current_item.as_deref()),
                task.created_at.to_rfc3339(),
                opt_text_owned(task.started_at.map(|t| t.to_rfc3339())),
                opt_text_owned(task.completed_at.map(|t| t.to_rfc3339())),
            ],
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("UNIQUE constraint") {
                StorageError::Constraint(format!("insert_task: {msg}"))
            } else {
                StorageError::Query(format!("insert_task: {msg}"))
            }
        })?;

        debug!(task_id = %task.task_id, canonical_key = %task.canonical_key, "Task inserted into DB");
        Ok(())
    }

    /// Get a task by its ID.
    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StorageError> {
        let conn = self.db.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StorageError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::Query(format!("get_task: {e}"))),
        }
    }

    /// List task summaries, newest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskSummary>, StorageError> {
        let conn = self.db.conn();
        let mut rows = match status {
            Some(status) => conn
                .query(
                    &format!(
                        "SELECT {SUMMARY_COLUMNS} FROM tasks
                         WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit as i64],
                )
                .await,
            None => conn
                .query(
                    &format!(
                        "SELECT {SUMMARY_COLUMNS} FROM tasks
                         ORDER BY created_at DESC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await,
        }
        .map_err(|e| StorageError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_summary(&row)?);
        }
        Ok(tasks)
    }

    /// Find the active task holding a canonical key, if any.
    ///
    /// The active-target index keeps this to at most one row.
    pub async fn find_conflicting(
        &self,
        canonical_key: &str,
    ) -> Result<Option<Task>, StorageError> {
        let conn = self.db.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE canonical_key = ?1 AND status IN ('pending', 'running')
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![canonical_key],
            )
            .await
            .map_err(|e| StorageError::Query(format!("find_conflicting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::Query(format!("find_conflicting: {e}"))),
        }
    }

    /// Transition a pending task to running, respecting the concurrency cap.
    ///
    /// The status guard and the running-count check sit in one statement so
    /// two concurrent admits cannot both slip under the cap. Returns whether
    /// the row changed.
    pub async fn mark_running(
        &self,
        task_id: Uuid,
        max_running: usize,
    ) -> Result<bool, StorageError> {
        let conn = self.db.conn();
        let now = Utc::now().to_rfc3339();
        let count = conn
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?2
                 WHERE task_id = ?1 AND status = 'pending'
                   AND (SELECT COUNT(*) FROM tasks WHERE status = 'running') < ?3",
                params![task_id.to_string(), now, max_running as i64],
            )
            .await
            .map_err(|e| StorageError::Query(format!("mark_running: {e}")))?;

        if count > 0 {
            debug!(task_id = %task_id, "Task marked running");
        }
        Ok(count > 0)
    }

    /// Record successful completion. No-ops unless the task is still running.
    pub async fn complete(
        &self,
        task_id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, StorageError> {
        let conn = self.db.conn();
        let result_str = serde_json::to_string(result)
            .map_err(|e| StorageError::Serialization(format!("task result: {e}")))?;
        let now = Utc::now().to_rfc3339();
        let count = conn
            .execute(
                "UPDATE tasks SET status = 'completed', result = ?2, progress = 100, completed_at = ?3
                 WHERE task_id = ?1 AND status = 'running'",
                params![task_id.to_string(), result_str, now],
            )
            .await
            .map_err(|e| StorageError::Query(format!("complete_task: {e}")))?;
        Ok(count > 0)
    }

    /// Record failure with a description. No-ops unless the task is still running.
    pub async fn fail(&self, task_id: Uuid, error_message: &str) -> Result<bool, StorageError> {
        let conn = self.db.conn();
        let now = Utc::now().to_rfc3339();
        let count = conn
            .execute(
                "UPDATE tasks SET status = 'failed', error_message = ?2, completed_at = ?3
                 WHERE task_id = ?1 AND status = 'running'",
                params![task_id.to_string(), error_message, now],
            )
            .await
            .map_err(|e| StorageError::Query(format!("fail_task: {e}")))?;
        Ok(count > 0)
    }

    /// Cancel a running task. No-ops if it already settled.
    pub async fn cancel_running(&self, task_id: Uuid) -> Result<bool, StorageError> {
        let conn = self.db.conn();
        let now = Utc::now().to_rfc3339();
        let count = conn
            .execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?2
                 WHERE task_id = ?1 AND status = 'running'",
                params![task_id.to_string(), now],
            )
            .await
            .map_err(|e| StorageError::Query(format!("cancel_running: {e}")))?;
        Ok(count > 0)
    }

    /// Cancel a pending task. No-ops if it already started or settled.
    pub async fn cancel_pending(&self, task_id: Uuid) -> Result<bool, StorageError> {
        let conn = self.db.conn();
        let now = Utc::now().to_rfc3339();
        let count = conn
            .execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?2
                 WHERE task_id = ?1 AND status = 'pending'",
                params![task_id.to_string(), now],
            )
            .await
            .map_err(|e| StorageError::Query(format!("cancel_pending: {e}")))?;
        Ok(count > 0)
    }

    /// Persist a progress update. No-ops once the task left the running
    /// status, so a late update cannot overwrite a terminal row.
    pub async fn record_progress(
        &self,
        task_id: Uuid,
        progress: u8,
        total_items: i64,
        current_item: Option<&str>,
    ) -> Result<bool, StorageError> {
        let conn = self.db.conn();
        let count = conn
            .execute(
                "UPDATE tasks SET progress = ?2, total_items = ?3, current_item = ?4
                 WHERE task_id = ?1 AND status = 'running'",
                params![
                    task_id.to_string(),
                    progress as i64,
                    total_items,
                    opt_text(current_item)
                ],
            )
            .await
            .map_err(|e| StorageError::Query(format!("record_progress: {e}")))?;
        Ok(count > 0)
    }

    /// All tasks ever created for a canonical key, newest first.
    pub async fn history_for_target(
        &self,
        canonical_key: &str,
        limit: usize,
    ) -> Result<Vec<TaskSummary>, StorageError> {
        let conn = self.db.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM tasks
                     WHERE canonical_key = ?1 ORDER BY created_at DESC LIMIT ?2"
                ),
                params![canonical_key, limit as i64],
            )
            .await
            .map_err(|e| StorageError::Query(format!("history_for_target: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_summary(&row)?);
        }
        Ok(tasks)
    }

    /// IDs of all tasks currently marked running.
    pub async fn running_ids(&self) -> Result<Vec<Uuid>, StorageError> {
        let conn = self.db.conn();
        let mut rows = conn
            .query("SELECT task_id FROM tasks WHERE status = 'running'", ())
            .await
            .map_err(|e| StorageError::Query(format!("running_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row
                .get(0)
                .map_err(|e| StorageError::Query(format!("running_ids: {e}")))?;
            if let Ok(id) = Uuid::parse_str(&id_str) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse a status string from the DB.
fn str_to_status(s: &str) -> Result<TaskStatus, StorageError> {
    match s {
        "pending" => Ok(TaskStatus::Pending),
        "running" => Ok(TaskStatus::Running),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => Err(StorageError::Serialization(format!(
            "unknown task status: {other}"
        ))),
    }
}

/// Parse a task type string from the DB.
fn str_to_task_type(s: &str) -> Result<TaskType, StorageError> {
    match s {
        "batch_process" => Ok(TaskType::BatchProcess),
        other => Err(StorageError::Serialization(format!(
            "unknown task type: {other}"
        ))),
    }
}

/// Parse an RFC 3339 timestamp, falling back to epoch on parse failure.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to a libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a Task.
///
/// Column order matches TASK_COLUMNS:
/// 0:task_id, 1:task_type, 2:status, 3:params, 4:canonical_key, 5:result,
/// 6:error_message, 7:progress, 8:total_items, 9:current_item,
/// 10:created_at, 11:started_at, 12:completed_at
fn row_to_task(row: &libsql::Row) -> Result<Task, StorageError> {
    let get_err = |e: libsql::Error| StorageError::Query(format!("row_to_task: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let type_str: String = row.get(1).map_err(get_err)?;
    let status_str: String = row.get(2).map_err(get_err)?;
    let params_str: String = row.get(3).map_err(get_err)?;
    let canonical_key: String = row.get(4).map_err(get_err)?;
    let result_str: Option<String> = row.get::<String>(5).ok();
    let error_message: Option<String> = row.get::<String>(6).ok();
    let progress: i64 = row.get(7).map_err(get_err)?;
    let total_items: i64 = row.get(8).map_err(get_err)?;
    let current_item: Option<String> = row.get::<String>(9).ok();
    let created_str: String = row.get(10).map_err(get_err)?;
    let started_str: Option<String> = row.get::<String>(11).ok();
    let completed_str: Option<String> = row.get::<String>(12).ok();

    let params = serde_json::from_str(&params_str)
        .map_err(|e| StorageError::Serialization(format!("task params: {e}")))?;
    let result = match result_str {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| StorageError::Serialization(format!("task result: {e}")))?,
        ),
        None => None,
    };

    Ok(Task {
        task_id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        task_type: str_to_task_type(&type_str)?,
        status: str_to_status(&status_str)?,
        params,
        canonical_key,
        result,
        error_message,
        progress: progress.clamp(0, 100) as u8,
        total_items,
        current_item,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

/// Map a libsql Row to a TaskSummary.
///
/// Column order matches SUMMARY_COLUMNS:
/// 0:task_id, 1:task_type, 2:status, 3:progress, 4:total_items,
/// 5:created_at, 6:started_at, 7:completed_at
fn row_to_summary(row: &libsql::Row) -> Result<TaskSummary, StorageError> {
    let get_err = |e: libsql::Error| StorageError::Query(format!("row_to_summary: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let type_str: String = row.get(1).map_err(get_err)?;
    let status_str: String = row.get(2).map_err(get_err)?;
    let progress: i64 = row.get(3).map_err(get_err)?;
    let total_items: i64 = row.get(4).map_err(get_err)?;
    let created_str: String = row.get(5).map_err(get_err)?;
    let started_str: Option<String> = row.get::<String>(6).ok();
    let completed_str: Option<String> = row.get::<String>(7).ok();

    Ok(TaskSummary {
        task_id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        task_type: str_to_task_type(&type_str)?,
        status: str_to_status(&status_str)?,
        progress: progress.clamp(0, 100) as u8,
        total_items,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> TaskStore {
        let db = Arc::new(Database::new_memory().await.unwrap());
        TaskStore::new(db)
    }

    fn make_task(key: &str) -> Task {
        Task::new(
            TaskType::BatchProcess,
            serde_json::json!({"target_key": key}),
            key.to_string(),
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = test_store().await;
        let task = make_task("chan/abc");
        let task_id = task.task_id;

        store.insert(&task).await.unwrap();

        let fetched = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, task_id);
        assert_eq!(fetched.task_type, TaskType::BatchProcess);
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.canonical_key, "chan/abc");
        assert_eq!(fetched.params["target_key"], "chan/abc");
        assert_eq!(fetched.progress, 0);
        assert!(fetched.result.is_none());
        assert!(fetched.error_message.is_none());
        assert!(fetched.started_at.is_none());
        assert!(fetched.completed_at.is_none());
    }

    #[tokio::test]
    async fn get_not_found() {
        let store = test_store().await;
        let result = store.get(Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn full_row_roundtrip() {
        let store = test_store().await;
        let mut task = make_task("chan/full");
        task.status = TaskStatus::Completed;
        task.result = Some(serde_json::json!({"items": 3}));
        task.error_message = Some("partial errors".to_string());
        task.progress = 42;
        task.total_items = 7;
        task.current_item = Some("item-3".to_string());
        task.started_at = Some(Utc::now());
        task.completed_at = Some(Utc::now());

        store.insert(&task).await.unwrap();

        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.result.unwrap()["items"], 3);
        assert_eq!(fetched.error_message.as_deref(), Some("partial errors"));
        assert_eq!(fetched.progress, 42);
        assert_eq!(fetched.total_items, 7);
        assert_eq!(fetched.current_item.as_deref(), Some("item-3"));
        assert!(fetched.started_at.is_some());
        assert!(fetched.completed_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_active_key_rejected() {
        let store = test_store().await;
        store.insert(&make_task("chan/dup")).await.unwrap();

        let err = store.insert(&make_task("chan/dup")).await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)), "got {err:?}");

        // Different key is fine
        store.insert(&make_task("chan/other")).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_key_allowed_after_terminal() {
        let store = test_store().await;
        let first = make_task("chan/reuse");
        store.insert(&first).await.unwrap();

        store.mark_running(first.task_id, 1).await.unwrap();
        store
            .complete(first.task_id, &serde_json::json!({}))
            .await
            .unwrap();

        store.insert(&make_task("chan/reuse")).await.unwrap();
    }

    #[tokio::test]
    async fn mark_running_respects_cap() {
        let store = test_store().await;
        let t1 = make_task("chan/a");
        let t2 = make_task("chan/b");
        store.insert(&t1).await.unwrap();
        store.insert(&t2).await.unwrap();

        assert!(store.mark_running(t1.task_id, 1).await.unwrap());
        // Cap of one is taken
        assert!(!store.mark_running(t2.task_id, 1).await.unwrap());

        let fetched = store.get(t2.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);

        // Slot frees once the first task settles
        store
            .complete(t1.task_id, &serde_json::json!({}))
            .await
            .unwrap();
        assert!(store.mark_running(t2.task_id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn mark_running_requires_pending() {
        let store = test_store().await;
        let task = make_task("chan/a");
        store.insert(&task).await.unwrap();

        assert!(store.mark_running(task.task_id, 1).await.unwrap());
        // Already running
        assert!(!store.mark_running(task.task_id, 1).await.unwrap());
        // Unknown task
        assert!(!store.mark_running(Uuid::new_v4(), 1).await.unwrap());

        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Running);
        assert!(fetched.started_at.is_some());
    }

    #[tokio::test]
    async fn complete_sets_fields_once() {
        let store = test_store().await;
        let task = make_task("chan/a");
        store.insert(&task).await.unwrap();
        store.mark_running(task.task_id, 1).await.unwrap();

        let result = serde_json::json!({"processed": 5});
        assert!(store.complete(task.task_id, &result).await.unwrap());

        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.result.unwrap()["processed"], 5);
        assert_eq!(fetched.progress, 100);
        assert!(fetched.completed_at.is_some());

        // A second terminal write loses the guard
        assert!(!store.complete(task.task_id, &result).await.unwrap());
        assert!(!store.fail(task.task_id, "too late").await.unwrap());
        assert!(!store.cancel_running(task.task_id).await.unwrap());
    }

    #[tokio::test]
    async fn fail_sets_error_message() {
        let store = test_store().await;
        let task = make_task("chan/a");
        store.insert(&task).await.unwrap();
        store.mark_running(task.task_id, 1).await.unwrap();

        assert!(store.fail(task.task_id, "boom").await.unwrap());

        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.error_message.as_deref(), Some("boom"));
        assert!(fetched.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_guards_by_status() {
        let store = test_store().await;
        let task = make_task("chan/a");
        store.insert(&task).await.unwrap();

        // Pending task: only the pending cancel hits
        assert!(!store.cancel_running(task.task_id).await.unwrap());
        assert!(store.cancel_pending(task.task_id).await.unwrap());
        assert!(!store.cancel_pending(task.task_id).await.unwrap());

        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Cancelled);
        assert!(fetched.completed_at.is_some());

        // Running task: only the running cancel hits
        let task2 = make_task("chan/b");
        store.insert(&task2).await.unwrap();
        store.mark_running(task2.task_id, 1).await.unwrap();
        assert!(!store.cancel_pending(task2.task_id).await.unwrap());
        assert!(store.cancel_running(task2.task_id).await.unwrap());
    }

    #[tokio::test]
    async fn late_progress_is_dropped() {
        let store = test_store().await;
        let task = make_task("chan/a");
        store.insert(&task).await.unwrap();
        store.mark_running(task.task_id, 1).await.unwrap();

        assert!(
            store
                .record_progress(task.task_id, 40, 5, Some("item-2"))
                .await
                .unwrap()
        );

        store.cancel_running(task.task_id).await.unwrap();

        // The task has settled, the update must not apply
        assert!(
            !store
                .record_progress(task.task_id, 60, 5, Some("item-3"))
                .await
                .unwrap()
        );

        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Cancelled);
        assert_eq!(fetched.progress, 40);
        assert_eq!(fetched.current_item.as_deref(), Some("item-2"));
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let store = test_store().await;
        let t1 = make_task("chan/a");
        let t2 = make_task("chan/b");
        let t3 = make_task("chan/c");
        store.insert(&t1).await.unwrap();
        store.insert(&t2).await.unwrap();
        store.insert(&t3).await.unwrap();

        // Backdate t1 and t2 to get a deterministic order
        {
            let conn = store.db.conn();
            for (task, hours) in [(&t1, 2), (&t2, 1)] {
                let old = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
                conn.execute(
                    "UPDATE tasks SET created_at = ?1 WHERE task_id = ?2",
                    params![old, task.task_id.to_string()],
                )
                .await
                .unwrap();
            }
        }

        let all = store.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].task_id, t3.task_id);
        assert_eq!(all[1].task_id, t2.task_id);
        assert_eq!(all[2].task_id, t1.task_id);

        store.mark_running(t1.task_id, 1).await.unwrap();
        let pending = store.list(Some(TaskStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        let running = store.list(Some(TaskStatus::Running), 10).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, t1.task_id);

        let limited = store.list(None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn find_conflicting_active_only() {
        let store = test_store().await;
        let task = make_task("chan/a");
        store.insert(&task).await.unwrap();

        let conflict = store.find_conflicting("chan/a").await.unwrap().unwrap();
        assert_eq!(conflict.task_id, task.task_id);
        assert!(store.find_conflicting("chan/b").await.unwrap().is_none());

        // Running still conflicts
        store.mark_running(task.task_id, 1).await.unwrap();
        assert!(store.find_conflicting("chan/a").await.unwrap().is_some());

        // Terminal does not
        store.fail(task.task_id, "boom").await.unwrap();
        assert!(store.find_conflicting("chan/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_for_target_spans_terminal_tasks() {
        let store = test_store().await;

        let first = make_task("chan/a");
        store.insert(&first).await.unwrap();
        store.mark_running(first.task_id, 1).await.unwrap();
        store.fail(first.task_id, "boom").await.unwrap();

        let second = make_task("chan/a");
        store.insert(&second).await.unwrap();
        store.insert(&make_task("chan/unrelated")).await.unwrap();

        // Backdate the first so ordering is deterministic
        {
            let conn = store.db.conn();
            let old = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
            conn.execute(
                "UPDATE tasks SET created_at = ?1 WHERE task_id = ?2",
                params![old, first.task_id.to_string()],
            )
            .await
            .unwrap();
        }

        let history = store.history_for_target("chan/a", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].task_id, second.task_id);
        assert_eq!(history[1].task_id, first.task_id);
        assert_eq!(history[1].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn running_ids_lists_running_only() {
        let store = test_store().await;
        let t1 = make_task("chan/a");
        let t2 = make_task("chan/b");
        store.insert(&t1).await.unwrap();
        store.insert(&t2).await.unwrap();
        store.mark_running(t1.task_id, 2).await.unwrap();

        let ids = store.running_ids().await.unwrap();
        assert_eq!(ids, vec![t1.task_id]);
    }
}
