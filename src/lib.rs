//! tideflow - a minimal, in-process workflow orchestrator.
//!
//! Tasks are nodes of a [`Dag`]; a run executes every task once, starting
//! each as soon as all of its upstream tasks succeeded, on a bounded pool of
//! workers. A failed task marks everything downstream of it as
//! [`State::UpstreamFailed`]. The [`Scheduler`] fires DAGs on their cron
//! [`Schedule`] and limits how many DAG runs execute at once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tideflow::{BashOperator, Dag, FnOperator, InMemoryStorage, RunId, run_dag};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dag = Dag::new("example");
//! let date = dag.add_task(BashOperator::new("print_date", "date"))?;
//! let done = dag.add_task(FnOperator::new("done", || async { Ok(()) }))?;
//! dag.set_downstream(&date, &done)?;
//!
//! let summary = run_dag(
//!     Arc::new(InMemoryStorage::new()),
//!     Arc::new(dag),
//!     RunId::new(),
//!     4,
//!     CancellationToken::new(),
//! )
//! .await?;
//! assert!(summary.is_success());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, Settings};
pub use core::dag::{Dag, DagError, Relative, TaskNode, TaskRef};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::state::State;
pub use core::task::{Task, TaskError};
pub use core::types::{DagId, RunId, TaskId};
pub use execution::{
    BashOperator, DagRunError, DagRunner, DagRunnerHandle, FnOperator, RunError, RunSummary,
    TaskRunner, run_dag,
};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
pub use storage::{DagRecord, DagRunRecord, InMemoryStorage, Storage, StorageError, TaskInstance};
