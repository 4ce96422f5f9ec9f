//! harvestq: an embedded job queue coordinator.
//!
//! Callers create tasks, start them on registered executors and follow
//! their progress; a relational store keeps every task's lifecycle so
//! state survives restarts. One non-terminal task per canonical target
//! key, a hard cap on concurrent runs, cooperative cancellation.

pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod task;

pub use config::QueueConfig;
pub use error::{Error, Result, StorageError, TaskError};
pub use queue::{JobExecutor, ProgressReporter, TaskQueue};
pub use store::Database;
pub use task::{ProgressUpdate, Task, TaskStatus, TaskSummary, TaskType, canonical_target_key};
