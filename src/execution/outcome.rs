//! Run errors and the summary returned when a DAG run completes.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::core::dag::DagError;
use crate::core::state::State;
use crate::core::types::{DagId, RunId, TaskId};
use crate::storage::StorageError;

/// Errors surfaced by a DAG run.
///
/// Task failures are not errors at this level; they are recorded in the
/// [`RunSummary`] and drive the upstream-failed cascade.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run was configured with unusable limits.
    #[error("invalid run configuration: {0}")]
    Config(String),

    /// The DAG failed validation before any task ran.
    #[error(transparent)]
    Dag(#[from] DagError),

    /// A persistence call failed; execution continued.
    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: StorageError,
    },

    /// The run coordinator panicked.
    #[error("run panicked: {0}")]
    Panicked(String),

    /// The run was cancelled before every task reached a terminal state.
    #[error("run {0} was cancelled before all tasks finished")]
    Cancelled(RunId),

    /// Every worker exited while tasks were still outstanding.
    #[error("worker pool exited before the run completed")]
    WorkersExited,

    /// The DAG runner is shutting down and no longer admits runs.
    #[error("DAG runner is not accepting requests")]
    RunnerClosed,

    /// The run task was aborted.
    #[error("run task did not complete: {0}")]
    Join(String),
}

/// An error attributed to one run of one DAG.
#[derive(Debug, Error)]
#[error("DAG[{dag_id}] run {run_id}: {source}")]
pub struct DagRunError {
    pub dag_id: DagId,
    pub run_id: RunId,
    #[source]
    pub source: RunError,
}

/// Final account of one DAG run.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: RunId,
    pub dag_id: DagId,
    /// `Failed` if any task failed or the run was cancelled, else `Success`.
    pub state: State,
    pub task_states: HashMap<TaskId, State>,
    pub success: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub upstream_failed: Vec<TaskId>,
    /// Non-fatal errors collected while the run progressed.
    pub errors: Vec<RunError>,
    pub duration: Duration,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.state == State::Success
    }

    pub fn state_of(&self, task: &str) -> Option<State> {
        self.task_states.get(&TaskId::new(task)).copied()
    }

    /// Number of tasks that reached a terminal state.
    pub fn accounted(&self) -> usize {
        self.success.len() + self.failed.len() + self.upstream_failed.len()
    }
}
