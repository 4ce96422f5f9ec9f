//! Configuration types.

use std::time::Duration;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of tasks running at once.
    pub max_running: usize,
    /// Attempts for a terminal status write before giving up.
    pub terminal_write_attempts: u32,
    /// Delay between terminal status write attempts.
    pub terminal_write_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_running: 1,
            terminal_write_attempts: 3,
            terminal_write_backoff: Duration::from_millis(200),
        }
    }
}
