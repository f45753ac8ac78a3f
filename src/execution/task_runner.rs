//! Coordinates a single DAG run: one evaluator plus a bounded worker pool.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::core::dag::Dag;
use crate::core::types::RunId;
use crate::storage::Storage;

use super::evaluator::Evaluator;
use super::outcome::{RunError, RunSummary};
use super::worker::Worker;

/// Runs every task of a DAG once, honoring dependencies.
///
/// At most `min(parallelism, dag concurrency, task count)` tasks of the run
/// execute at the same time. Each call to [`TaskRunner::run`] uses a fresh
/// state table, so the same runner (and DAG) can serve concurrent runs.
pub struct TaskRunner<S> {
    dag: Arc<Dag>,
    storage: Arc<S>,
    parallelism: usize,
}

impl<S: Storage + 'static> TaskRunner<S> {
    /// Validate the DAG and the parallelism limit.
    pub fn new(dag: Arc<Dag>, storage: Arc<S>, parallelism: usize) -> Result<Self, RunError> {
        if parallelism == 0 {
            return Err(RunError::Config(
                "parallelism must be greater than zero".into(),
            ));
        }
        if dag.concurrency() == Some(0) {
            return Err(RunError::Config(format!(
                "{} concurrency must be greater than zero",
                dag.formatted_id()
            )));
        }
        dag.validate()?;
        Ok(Self {
            dag,
            storage,
            parallelism,
        })
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    /// Number of workers a run of this DAG spawns.
    pub fn worker_count(&self) -> usize {
        let limit = match self.dag.concurrency() {
            Some(concurrency) => concurrency.min(self.parallelism),
            None => self.parallelism,
        };
        limit.min(self.dag.len())
    }

    /// Execute the run until every task is terminal or `cancel` fires.
    pub async fn run(&self, run_id: RunId, cancel: CancellationToken) -> RunSummary {
        let span = info_span!("dag_run", dag = %self.dag.id(), run_id = %run_id);
        self.execute(run_id, cancel).instrument(span).await
    }

    async fn execute(&self, run_id: RunId, cancel: CancellationToken) -> RunSummary {
        let workers = self.worker_count();
        // every task is sent at most once, so sends never wait on capacity
        let (run_tx, run_rx) = mpsc::channel(self.dag.len().max(1));
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(run_rx));
        let kill = CancellationToken::new();

        info!(tasks = self.dag.len(), workers, "starting run");
        let mut pool = JoinSet::new();
        for index in 0..workers {
            let worker = Worker::new(
                index,
                queue.clone(),
                results_tx.clone(),
                kill.child_token(),
                cancel.clone(),
            );
            pool.spawn(worker.start().in_current_span());
        }
        // only workers hold result senders, a closed channel means the pool is gone
        drop(results_tx);

        let evaluator = Evaluator::new(
            self.dag.clone(),
            self.storage.clone(),
            run_id,
            run_tx,
            results_rx,
            kill,
        );
        let summary = evaluator.run(&cancel).await;

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker did not shut down cleanly");
            }
        }

        info!(
            state = %summary.state,
            success = summary.success.len(),
            failed = summary.failed.len(),
            upstream_failed = summary.upstream_failed.len(),
            elapsed = ?summary.duration,
            "run finished"
        );
        summary
    }
}
