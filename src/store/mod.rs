//! Persistence layer: libSQL-backed storage for tasks.

pub mod db;
pub mod migrations;
pub mod tasks;

pub use db::Database;
pub use tasks::TaskStore;
