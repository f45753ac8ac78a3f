//! Task execution: operators, the per-run evaluator and worker pool, and
//! admission of DAG runs.

mod bash;
mod dag_runner;
mod evaluator;
mod function;
mod outcome;
mod task_runner;
mod worker;

pub use bash::{BashOperator, BashOperatorBuilder};
pub use dag_runner::{DagRunRequest, DagRunner, DagRunnerHandle, run_dag};
pub use function::FnOperator;
pub use outcome::{DagRunError, RunError, RunSummary};
pub use task_runner::TaskRunner;
