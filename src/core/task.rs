//! Task trait and error types.
//!
//! A [`Task`] is the operator contract: anything with an id that can be run
//! once and report success or an error. Graph edges and per-run state are
//! owned by the [`Dag`](super::dag::Dag) and the run coordinator, not by the
//! task itself, so one task value can be shared by many concurrent runs.

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// External command exited unsuccessfully.
    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// The unit of work placed in a DAG.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use tideflow::{Task, TaskError};
///
/// struct Greet;
///
/// #[async_trait]
/// impl Task for Greet {
///     fn id(&self) -> &str {
///         "greet"
///     }
///
///     async fn run(&self) -> Result<(), TaskError> {
///         println!("hello");
///         Ok(())
///     }
/// }
///
/// assert_eq!(Greet.formatted_id(), "[TASK] greet");
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// Identifier, unique within the owning DAG.
    fn id(&self) -> &str;

    /// Execute the task body once.
    async fn run(&self) -> Result<(), TaskError>;

    /// Label used in logs and tree views.
    fn formatted_id(&self) -> String {
        format!("[TASK] {}", self.id())
    }

    /// Retry budget recorded on task instances.
    fn retries(&self) -> u32 {
        0
    }

    /// Short name of the operator kind, recorded on task instances.
    fn operator(&self) -> &'static str {
        "task"
    }
}
