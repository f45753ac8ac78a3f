//! Workers that pull tasks off a run's queue and execute them.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::state::State;
use crate::core::task::{Task, TaskError};
use crate::core::types::TaskId;
use crate::storage::TaskInstance;

/// A task in flight between the evaluator and a worker.
///
/// Ownership moves with the message: whoever holds the item is the only
/// writer of its state and instance record.
pub(crate) struct WorkItem {
    pub(crate) task_id: TaskId,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) state: State,
    pub(crate) instance: TaskInstance,
}

/// Receiving end of the run queue, shared by every worker of one run.
pub(crate) type SharedQueue = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

pub(crate) struct Worker {
    name: String,
    queue: SharedQueue,
    results: mpsc::UnboundedSender<WorkItem>,
    kill: CancellationToken,
    cancel: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        queue: SharedQueue,
        results: mpsc::UnboundedSender<WorkItem>,
        kill: CancellationToken,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: format!("worker-{index}"),
            queue,
            results,
            kill,
            cancel,
        }
    }

    /// Execute one task at a time until killed, cancelled or the queue closes.
    pub(crate) async fn start(self) {
        debug!(worker = %self.name, "worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.kill.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                item = Self::next(&self.queue) => item,
            };
            let Some(mut item) = next else {
                break;
            };

            item.state = State::Running;
            info!(worker = %self.name, task = %item.task.formatted_id(), "running task");

            match execute(item.task.clone()).await {
                Ok(()) => item.state = State::Success,
                Err(e) => {
                    item.state = State::Failed;
                    item.instance.error = Some(e.to_string());
                }
            }

            if self.results.send(item).is_err() {
                // evaluator is gone, nobody will read further results
                break;
            }
        }
        debug!(worker = %self.name, "worker exited");
    }

    async fn next(queue: &SharedQueue) -> Option<WorkItem> {
        queue.lock().await.recv().await
    }
}

/// Run a task on its own tokio task so a panic is reported as a failure.
pub(crate) async fn execute(task: Arc<dyn Task>) -> Result<(), TaskError> {
    match tokio::spawn(async move { task.run().await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(TaskError::ExecutionFailed(e.to_string())),
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
