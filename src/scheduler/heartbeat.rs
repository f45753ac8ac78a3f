//! Periodic check for DAGs whose next fire time has passed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::dag::{Dag, DagError};
use crate::core::types::DagId;
use crate::storage::Storage;

/// Registered DAGs, immutable once the scheduler starts.
pub(crate) type DagTable = Arc<HashMap<DagId, Arc<Dag>>>;

/// Next fire time of every DAG that still has one.
pub(crate) type NextRuns = Arc<Mutex<HashMap<DagId, DateTime<Utc>>>>;

pub(crate) fn lock_next_runs(
    next_runs: &Mutex<HashMap<DagId, DateTime<Utc>>>,
) -> MutexGuard<'_, HashMap<DagId, DateTime<Utc>>> {
    next_runs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Compute the DAG's next fire time from now and store it.
///
/// A DAG whose window has closed, or whose schedule has no further
/// occurrences, is left without an entry and never fires again.
pub(crate) fn schedule_next(dag: &Dag, next_runs: &Mutex<HashMap<DagId, DateTime<Utc>>>) {
    match dag.next_run() {
        Ok(next) => {
            debug!(dag = %dag.id(), next_run = %next, "next run scheduled");
            lock_next_runs(next_runs).insert(dag.id().clone(), next);
        }
        Err(DagError::WindowClosed(_)) => {
            info!(dag = %dag.id(), "schedule window closed, not rescheduling");
        }
        Err(DagError::Unscheduled(_)) => {}
        Err(e) => {
            error!(dag = %dag.id(), error = %e, "failed to compute next run");
        }
    }
}

pub(crate) struct Heartbeat<S> {
    dags: DagTable,
    next_runs: NextRuns,
    storage: Arc<S>,
    triggers: mpsc::Sender<DagId>,
    interval: Duration,
}

impl<S: Storage> Heartbeat<S> {
    pub(crate) fn new(
        dags: DagTable,
        next_runs: NextRuns,
        storage: Arc<S>,
        triggers: mpsc::Sender<DagId>,
        interval: Duration,
    ) -> Self {
        Self {
            dags,
            next_runs,
            storage,
            triggers,
            interval,
        }
    }

    /// Beat every `interval` until cancelled or the trigger receiver is gone.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval = ?self.interval, "heartbeat started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.beat(Utc::now()).await.is_none() {
                        warn!("trigger channel closed, stopping heartbeat");
                        break;
                    }
                }
            }
        }
        debug!("heartbeat stopped");
    }

    /// Fire every DAG due at `now`.
    ///
    /// Due entries are removed before firing; the scheduler re-arms a DAG when
    /// it handles the trigger. Paused DAGs are re-armed here without firing.
    /// Returns the fired ids, or `None` once the trigger channel is closed.
    pub(crate) async fn beat(&self, now: DateTime<Utc>) -> Option<Vec<DagId>> {
        let due = self.take_due(now);
        let mut fired = Vec::with_capacity(due.len());

        for dag_id in due {
            match self.storage.get_dag(&dag_id).await {
                Ok(record) if record.is_paused => {
                    debug!(dag = %dag_id, "DAG is paused, skipping");
                    if let Some(dag) = self.dags.get(&dag_id) {
                        schedule_next(dag, &self.next_runs);
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(dag = %dag_id, error = %e, "failed to read DAG record"),
            }

            if let Err(e) = self.storage.update_last_scheduler_run(&dag_id, now).await {
                warn!(dag = %dag_id, error = %e, "failed to record scheduler run");
            }

            info!(dag = %dag_id, "firing scheduled run");
            if self.triggers.send(dag_id.clone()).await.is_err() {
                return None;
            }
            fired.push(dag_id);
        }

        Some(fired)
    }

    fn take_due(&self, now: DateTime<Utc>) -> Vec<DagId> {
        let mut next_runs = lock_next_runs(&self.next_runs);
        let mut due: Vec<DagId> = next_runs
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            next_runs.remove(id);
        }
        due.sort();
        due
    }
}
