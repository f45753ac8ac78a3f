//! Admission of DAG runs under a global concurrency limit.
//!
//! The [`DagRunner`] receives run requests over a channel. For each request
//! it first acquires a permit from a semaphore sized to `dag_concurrency`,
//! so requests beyond the limit wait in the channel, then spawns the run.
//! A run's failures, including a panic of the run itself, are reported on
//! the error channel instead of taking the runner down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::core::dag::Dag;
use crate::core::state::State;
use crate::core::types::RunId;
use crate::storage::{DagRunRecord, Storage};

use super::outcome::{DagRunError, RunError, RunSummary};
use super::task_runner::TaskRunner;
use super::worker::panic_message;

/// Buffer size for the request channel between handles and the runner.
pub(crate) const REQUEST_CHANNEL_BUFFER: usize = 32;

/// A request to execute one run of a DAG.
pub struct DagRunRequest {
    pub dag: Arc<Dag>,
    pub run_id: RunId,
}

/// Sending side of a [`DagRunner`].
#[derive(Clone)]
pub struct DagRunnerHandle {
    tx: mpsc::Sender<DagRunRequest>,
}

impl DagRunnerHandle {
    /// Queue a run of `dag` and return its id.
    pub async fn submit(&self, dag: Arc<Dag>) -> Result<RunId, RunError> {
        let run_id = RunId::new();
        self.submit_with_id(dag, run_id.clone()).await?;
        Ok(run_id)
    }

    pub async fn submit_with_id(&self, dag: Arc<Dag>, run_id: RunId) -> Result<(), RunError> {
        self.tx
            .send(DagRunRequest { dag, run_id })
            .await
            .map_err(|_| RunError::RunnerClosed)
    }
}

pub struct DagRunner<S> {
    storage: Arc<S>,
    parallelism: usize,
    dag_concurrency: usize,
    semaphore: Arc<Semaphore>,
    shutdown_timeout: Duration,
    requests: mpsc::Receiver<DagRunRequest>,
    errors: mpsc::UnboundedSender<DagRunError>,
}

impl<S: Storage + 'static> DagRunner<S> {
    /// Build a runner and the handle that feeds it.
    ///
    /// Fails if `settings` do not validate; a zero `dag_concurrency` would
    /// otherwise leave every submitted run waiting forever.
    pub fn new(
        storage: Arc<S>,
        settings: &Settings,
        errors: mpsc::UnboundedSender<DagRunError>,
    ) -> Result<(Self, DagRunnerHandle), RunError> {
        settings
            .validate()
            .map_err(|e| RunError::Config(e.to_string()))?;
        let (tx, requests) = mpsc::channel(REQUEST_CHANNEL_BUFFER);
        let runner = Self {
            storage,
            parallelism: settings.core.parallelism,
            dag_concurrency: settings.core.dag_concurrency,
            semaphore: Arc::new(Semaphore::new(settings.core.dag_concurrency)),
            shutdown_timeout: settings.shutdown_timeout(),
            requests,
            errors,
        };
        Ok((runner, DagRunnerHandle { tx }))
    }

    /// Admit runs until `cancel` fires or every handle is dropped, then
    /// wait for in-flight runs.
    ///
    /// In-flight runs get `shutdown_timeout` to finish on their own before
    /// their cancellation token is fired.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(dag_concurrency = self.dag_concurrency, "DAG runner started");
        let runs = CancellationToken::new();
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("closing DAG runner");
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "run supervisor did not complete");
                    }
                }
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        debug!("all DAG runner handles dropped");
                        break;
                    };
                    let Some(permit) = self.admit(&cancel).await else {
                        break;
                    };
                    info!(dag = %request.dag.formatted_id(), run_id = %request.run_id, "admitted DAG run");
                    in_flight.spawn(supervise(
                        self.storage.clone(),
                        request,
                        self.parallelism,
                        runs.child_token(),
                        self.errors.clone(),
                        permit,
                    ));
                }
            }
        }

        self.requests.close();
        self.drain(in_flight, runs).await;
        info!("DAG runner stopped");
    }

    /// Wait for a permit; `None` if cancelled first.
    async fn admit(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<()>, runs: CancellationToken) {
        if in_flight.is_empty() {
            return;
        }
        info!(
            runs = in_flight.len(),
            timeout = ?self.shutdown_timeout,
            "waiting for in-flight DAG runs"
        );

        if tokio::time::timeout(self.shutdown_timeout, join_all(&mut in_flight))
            .await
            .is_ok()
        {
            info!("all in-flight DAG runs completed");
            return;
        }

        warn!(
            remaining = in_flight.len(),
            "shutdown timeout exceeded, cancelling in-flight DAG runs"
        );
        runs.cancel();
        if tokio::time::timeout(self.shutdown_timeout, join_all(&mut in_flight))
            .await
            .is_err()
        {
            warn!(
                remaining = in_flight.len(),
                "abandoning DAG runs that ignored cancellation"
            );
            in_flight.abort_all();
        }
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "run supervisor did not complete");
        }
    }
}

/// Aborts the run task when its supervisor goes away, so that aborting the
/// supervisor during shutdown does not leave the run executing detached.
struct RunTask<T>(JoinHandle<T>);

impl<T> Drop for RunTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Execute one run while holding its admission permit and report errors.
async fn supervise<S: Storage + 'static>(
    storage: Arc<S>,
    request: DagRunRequest,
    parallelism: usize,
    cancel: CancellationToken,
    errors: mpsc::UnboundedSender<DagRunError>,
    _permit: OwnedSemaphorePermit,
) {
    let DagRunRequest { dag, run_id } = request;
    let dag_id = dag.id().clone();

    let mut run = RunTask(tokio::spawn(run_dag(
        storage.clone(),
        dag,
        run_id.clone(),
        parallelism,
        cancel,
    )));
    let outcome = match (&mut run.0).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!(dag = %dag_id, run_id = %run_id, panic = %message, "DAG run panicked");
            mark_failed(storage.as_ref(), &run_id).await;
            Err(RunError::Panicked(message))
        }
        Err(e) => Err(RunError::Join(e.to_string())),
    };

    let failures = match outcome {
        Ok(summary) => summary.errors,
        Err(e) => vec![e],
    };
    for source in failures {
        let report = DagRunError {
            dag_id: dag_id.clone(),
            run_id: run_id.clone(),
            source,
        };
        if errors.send(report).is_err() {
            debug!(dag = %dag_id, "error channel closed, dropping run error");
        }
    }
}

async fn mark_failed<S: Storage>(storage: &S, run_id: &RunId) {
    match storage.get_dag_run(run_id).await {
        Ok(mut record) if !record.state.is_terminal() => {
            record.finish(State::Failed);
            if let Err(e) = storage.update_dag_run(record).await {
                warn!(run_id = %run_id, error = %e, "Failed to mark panicked run as failed");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(run_id = %run_id, error = %e, "Failed to load panicked run"),
    }
}

/// Execute one run of `dag` and keep its [`DagRunRecord`] current.
///
/// Storage failures are collected into the summary; only an invalid DAG or
/// parallelism setting prevents the run from starting.
pub async fn run_dag<S: Storage + 'static>(
    storage: Arc<S>,
    dag: Arc<Dag>,
    run_id: RunId,
    parallelism: usize,
    cancel: CancellationToken,
) -> Result<RunSummary, RunError> {
    let runner = TaskRunner::new(dag.clone(), storage.clone(), parallelism)?;
    let mut storage_errors = Vec::new();

    let mut record = DagRunRecord::new(run_id.clone(), dag.id().clone());
    record.mark_running();
    if let Err(source) = storage.create_dag_run(record.clone()).await {
        warn!(run_id = %run_id, error = %source, "Failed to create DAG run record");
        storage_errors.push(RunError::Storage {
            context: format!("create run record for {}", dag.formatted_id()),
            source,
        });
    }

    let mut summary = runner.run(run_id.clone(), cancel).await;

    record.finish(summary.state);
    if let Err(source) = storage.update_dag_run(record).await {
        warn!(run_id = %run_id, error = %source, "Failed to update DAG run record");
        storage_errors.push(RunError::Storage {
            context: format!("update run record for {}", dag.formatted_id()),
            source,
        });
    }

    info!(dag = %dag.formatted_id(), state = %summary.state, elapsed = ?summary.duration, "DAG run done");
    summary.errors.extend(storage_errors);
    Ok(summary)
}
