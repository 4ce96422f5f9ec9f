//! Error types for the task queue.

use uuid::Uuid;

/// Top-level error type for the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Storage-related errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task admission and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Duplicate task for target {target_key}: task {conflicting_task_id} is {conflicting_status}")]
    Duplicate {
        target_key: String,
        conflicting_task_id: Uuid,
        conflicting_status: String,
    },

    #[error("Maximum running tasks ({max}) reached")]
    ConcurrencyLimit { max: usize },

    #[error("Operation not valid for task {id} in state {status}")]
    InvalidState { id: Uuid, status: String },

    #[error("Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("Task params must include a non-empty target_key")]
    MissingTargetKey,
}

/// Result type alias for the queue.
pub type Result<T> = std::result::Result<T, Error>;
