//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use crate::config::ConfigError;
use crate::core::dag::DagError;
use crate::core::types::{DagId, RunId};
use crate::execution::RunError;
use crate::storage::StorageError;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A DAG with the same id is already registered.
    #[error("DAG already registered: {0}")]
    DuplicateDag(DagId),

    /// DAG not found.
    #[error("DAG not found: {0}")]
    DagNotFound(DagId),

    /// The DAG is invalid or its schedule cannot be evaluated.
    #[error(transparent)]
    Dag(#[from] DagError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid settings.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The DAG runner could not be started.
    #[error(transparent)]
    Run(#[from] RunError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The scheduler task ended abnormally.
    #[error("scheduler task failed: {0}")]
    Join(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    /// No new runs are admitted; in-flight runs are draining.
    ShuttingDown,
    Stopped,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Run a DAG now, outside its schedule.
    Trigger {
        dag_id: DagId,
        response: oneshot::Sender<Result<RunId, SchedulerError>>,
    },
    /// Pause or unpause scheduled runs of a DAG.
    SetPaused {
        dag_id: DagId,
        paused: bool,
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
