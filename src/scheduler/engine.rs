//! Scheduler engine implementation.
//!
//! The scheduler owns the registered DAGs and drives three concurrent parts:
//! - the heartbeat, which fires DAGs whose next run time has passed
//! - the [`DagRunner`], which admits runs under the global DAG concurrency limit
//! - the control loop, which handles triggers, commands and run errors

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, Settings};
use crate::core::dag::{Dag, DagError};
use crate::core::types::{DagId, RunId};
use crate::execution::{DagRunError, DagRunner, DagRunnerHandle};
use crate::storage::{DagRecord, Storage};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::heartbeat::{DagTable, Heartbeat, NextRuns, schedule_next};
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for DAG ids fired by the heartbeat.
const TRIGGER_CHANNEL_BUFFER: usize = 64;

/// Cron scheduler for a fixed set of DAGs.
pub struct Scheduler<S: Storage> {
    dags: HashMap<DagId, Arc<Dag>>,
    storage: Arc<S>,
    settings: Settings,
    heartbeat: Duration,
    default_timezone: Tz,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a scheduler with the given storage.
    pub fn new(storage: S, settings: Settings) -> Result<Self, SchedulerError> {
        Self::with_storage(Arc::new(storage), settings)
    }

    /// Create a scheduler with shared storage.
    pub fn with_storage(storage: Arc<S>, settings: Settings) -> Result<Self, SchedulerError> {
        settings.validate()?;
        Ok(Self {
            dags: HashMap::new(),
            storage,
            heartbeat: settings.heartbeat(),
            default_timezone: settings.default_timezone()?,
            settings,
        })
    }

    /// Override the heartbeat interval from the settings.
    pub fn with_heartbeat(mut self, interval: Duration) -> Result<Self, SchedulerError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "heartbeat interval must be greater than zero".into(),
            )
            .into());
        }
        self.heartbeat = interval;
        Ok(self)
    }

    /// Register a DAG and make sure it has a storage record.
    ///
    /// A schedule that names no timezone is evaluated in
    /// `core.default_timezone`.
    pub async fn add_dag(&mut self, mut dag: Dag) -> Result<(), SchedulerError> {
        if self.dags.contains_key(dag.id()) {
            return Err(SchedulerError::DuplicateDag(dag.id().clone()));
        }
        dag.validate()?;
        dag.set_default_timezone(self.default_timezone);
        self.storage
            .get_or_create_dag(DagRecord::from_dag(&dag))
            .await?;
        info!(dag = %dag.id(), tasks = dag.len(), "registered DAG");
        self.dags.insert(dag.id().clone(), Arc::new(dag));
        Ok(())
    }

    pub fn get_dag(&self, id: &DagId) -> Option<&Arc<Dag>> {
        self.dags.get(id)
    }

    pub fn dags(&self) -> impl Iterator<Item = &Arc<Dag>> {
        self.dags.values()
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Start the scheduler and return a handle for controlling it.
    ///
    /// The scheduler runs until [`SchedulerHandle::shutdown`] is called.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<Result<(), SchedulerError>>) {
        self.spawn(std::future::pending())
    }

    /// Run until the process receives an interrupt, then shut down gracefully.
    pub async fn run(self) -> Result<(), SchedulerError> {
        let (_handle, task) = self.spawn(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for interrupt");
                std::future::pending::<()>().await;
            }
        });
        task.await
            .map_err(|e| SchedulerError::Join(e.to_string()))?
    }

    fn spawn(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> (SchedulerHandle, JoinHandle<Result<(), SchedulerError>>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };
        let task = tokio::spawn(self.run_loop(command_rx, state, shutdown));

        (handle, task)
    }

    /// Main scheduler loop.
    async fn run_loop(
        self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), SchedulerError> {
        let Scheduler {
            dags,
            storage,
            settings,
            heartbeat,
            ..
        } = self;
        let dags: DagTable = Arc::new(dags);

        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        let setup = initial_runs(&dags).and_then(|next_runs| {
            let runner = DagRunner::new(storage.clone(), &settings, errors_tx)?;
            Ok((next_runs, runner))
        });
        let (next_runs, (runner, runner_handle)) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                *state.write().await = SchedulerState::Stopped;
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let (trigger_tx, mut trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_BUFFER);
        let runner_task = tokio::spawn(runner.run(token.child_token()));
        let heartbeat_task = tokio::spawn(
            Heartbeat::new(
                dags.clone(),
                next_runs.clone(),
                storage.clone(),
                trigger_tx,
                heartbeat,
            )
            .run(token.child_token()),
        );

        info!(dags = dags.len(), heartbeat = ?heartbeat, "scheduler started");
        tokio::pin!(shutdown);
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("interrupt received, shutting down");
                    break;
                }

                Some(dag_id) = trigger_rx.recv() => {
                    let Some(dag) = dags.get(&dag_id) else {
                        warn!(dag = %dag_id, "heartbeat fired an unknown DAG");
                        continue;
                    };
                    schedule_next(dag, &next_runs);
                    if let Err(e) = runner_handle.submit(dag.clone()).await {
                        error!(dag = %dag_id, error = %e, "failed to submit scheduled run");
                    }
                }

                Some(report) = errors_rx.recv() => log_run_error(&report),

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Trigger { dag_id, response } => {
                            let result = trigger(&dags, &runner_handle, &dag_id).await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::SetPaused { dag_id, paused, response } => {
                            let result = set_paused(&dags, storage.as_ref(), &dag_id, paused).await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::Shutdown { response } => {
                            shutdown_reply = Some(response);
                            break;
                        }
                    }
                }

                else => break,
            }
        }

        *state.write().await = SchedulerState::ShuttingDown;
        token.cancel();
        drop(runner_handle);

        if let Err(e) = heartbeat_task.await {
            warn!(error = %e, "heartbeat task did not complete");
        }
        if let Err(e) = runner_task.await {
            warn!(error = %e, "DAG runner task did not complete");
        }
        while let Ok(report) = errors_rx.try_recv() {
            log_run_error(&report);
        }

        *state.write().await = SchedulerState::Stopped;
        info!("scheduler stopped");
        if let Some(response) = shutdown_reply {
            let _ = response.send(());
        }
        Ok(())
    }
}

/// Compute the first fire time of every scheduled DAG.
fn initial_runs(dags: &DagTable) -> Result<NextRuns, SchedulerError> {
    let now = Utc::now();
    let mut next_runs = HashMap::new();
    for dag in dags.values() {
        match dag.next_run_after(now) {
            Ok(next) => {
                info!(dag = %dag.id(), next_run = %next, "DAG scheduled");
                next_runs.insert(dag.id().clone(), next);
            }
            Err(DagError::Unscheduled(_)) => {
                debug!(dag = %dag.id(), "DAG has no schedule, manual triggers only");
            }
            Err(DagError::WindowClosed(_)) => {
                info!(dag = %dag.id(), "schedule window already closed");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Arc::new(Mutex::new(next_runs)))
}

async fn trigger(
    dags: &DagTable,
    runner: &DagRunnerHandle,
    dag_id: &DagId,
) -> Result<RunId, SchedulerError> {
    let dag = dags
        .get(dag_id)
        .ok_or_else(|| SchedulerError::DagNotFound(dag_id.clone()))?;
    let run_id = runner
        .submit(dag.clone())
        .await
        .map_err(|e| SchedulerError::ChannelError(e.to_string()))?;
    info!(dag = %dag_id, run_id = %run_id, "manually triggered run");
    Ok(run_id)
}

async fn set_paused<S: Storage + ?Sized>(
    dags: &DagTable,
    storage: &S,
    dag_id: &DagId,
    paused: bool,
) -> Result<(), SchedulerError> {
    if !dags.contains_key(dag_id) {
        return Err(SchedulerError::DagNotFound(dag_id.clone()));
    }
    storage.set_dag_paused(dag_id, paused).await?;
    info!(dag = %dag_id, paused, "updated DAG pause state");
    Ok(())
}

fn log_run_error(report: &DagRunError) {
    error!(
        dag = %report.dag_id,
        run_id = %report.run_id,
        error = %report.source,
        "DAG run error"
    );
}
