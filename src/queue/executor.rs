//! Executor contract: the pluggable blocking job body.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::task::ProgressUpdate;

/// A blocking job body, invoked on a dedicated blocking thread.
///
/// Implementations should call `cancel.is_cancelled()` between units of
/// work and return promptly once it is set. The queue settles the task as
/// cancelled in that case, whatever the executor returns afterwards.
pub trait JobExecutor: Send + Sync {
    /// Execute the job. The returned value is stored as the task result;
    /// an error is rendered into the task's error message.
    fn run(
        &self,
        params: serde_json::Value,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Handle an executor uses to report progress.
///
/// Reports never block. Each report replaces the previous unseen one, so
/// under backpressure only the newest update reaches the store. Dropping
/// the reporter (by returning from the job body) lets the queue flush the
/// final update and settle the task.
pub struct ProgressReporter {
    tx: watch::Sender<Option<ProgressUpdate>>,
}

impl ProgressReporter {
    pub(crate) fn new(tx: watch::Sender<Option<ProgressUpdate>>) -> Self {
        Self { tx }
    }

    /// Report progress. `current_item` labels the unit being processed.
    pub fn report(&self, current: i64, total: i64, current_item: Option<&str>) {
        let update = ProgressUpdate {
            current,
            total,
            current_item: current_item.map(str::to_string),
        };
        // A closed channel means the run is already being torn down.
        let _ = self.tx.send(Some(update));
    }
}
