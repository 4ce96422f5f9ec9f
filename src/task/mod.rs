//! Task domain types.
//!
//! Core components:
//! - `model`: task record, status state machine, progress updates
//! - `target`: canonical target keys for duplicate detection

pub mod model;
pub mod target;

pub use model::{ProgressUpdate, Task, TaskStatus, TaskSummary, TaskType};
pub use target::canonical_target_key;
