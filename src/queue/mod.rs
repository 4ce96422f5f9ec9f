//! Task queue core.
//!
//! Components:
//! - `executor`: the blocking job trait and its progress reporter
//! - `runner`: concurrency-capped execution on blocking worker threads
//! - `manager`: admission, lifecycle and recovery over the store

pub mod executor;
pub mod manager;
pub mod runner;

pub use executor::{JobExecutor, ProgressReporter};
pub use manager::TaskQueue;
pub use runner::TaskRunner;
