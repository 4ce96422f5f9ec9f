//! Task domain model and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is admitted and waiting to be started.
    Pending,
    /// Task is currently executing.
    Running,
    /// Task finished successfully.
    Completed,
    /// Task finished with an error.
    Failed,
    /// Task was cancelled before it finished.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the task is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// String form, identical to the stored and serialized representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of work a task performs. Each type maps to a registered executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Process a batch of items for one target.
    BatchProcess,
}

impl TaskType {
    /// String form, identical to the stored and serialized representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchProcess => "batch_process",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued unit of work, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub task_id: Uuid,
    /// Kind of work.
    pub task_type: TaskType,
    /// Current status.
    pub status: TaskStatus,
    /// Caller-supplied parameters. Must contain a `target_key` string.
    pub params: serde_json::Value,
    /// Canonical form of the target key, computed at admission.
    pub canonical_key: String,
    /// Executor result payload, set on completion.
    pub result: Option<serde_json::Value>,
    /// Failure description, set when the task fails.
    pub error_message: Option<String>,
    /// Completion percentage, 0-100.
    pub progress: u8,
    /// Total number of items the executor reported.
    pub total_items: i64,
    /// Label of the item most recently processed.
    pub current_item: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(task_type: TaskType, params: serde_json::Value, canonical_key: String) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            task_type,
            status: TaskStatus::Pending,
            params,
            canonical_key,
            result: None,
            error_message: None,
            progress: 0,
            total_items: 0,
            current_item: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Listing projection of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Unique task ID.
    pub task_id: Uuid,
    /// Kind of work.
    pub task_type: TaskType,
    /// Current status.
    pub status: TaskStatus,
    /// Completion percentage, 0-100.
    pub progress: u8,
    /// Total number of items the executor reported.
    pub total_items: i64,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A progress report from a running executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Items processed so far.
    pub current: i64,
    /// Total items, if known. Zero or negative means unknown.
    pub total: i64,
    /// Label of the item being processed.
    pub current_item: Option<String>,
}

impl ProgressUpdate {
    /// Completion percentage: `round(current / total * 100)` clamped to
    /// 0-100, or 0 when the total is unknown.
    pub fn percentage(&self) -> u8 {
        if self.total <= 0 {
            return 0;
        }
        let pct = (self.current as f64 / self.total as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }
}
