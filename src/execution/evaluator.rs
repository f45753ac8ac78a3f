//! The per-run state machine.
//!
//! One evaluator owns the state table of one DAG run. Tasks become ready
//! when their count of unresolved upstream tasks drops to zero; they are
//! then recorded, started and pushed onto the run queue. Workers send each
//! task back once it has run, and the evaluator either releases its
//! downstream tasks or marks the whole downstream closure upstream-failed.
//! The run is complete once every task has reached a terminal state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::dag::Dag;
use crate::core::state::State;
use crate::core::types::{RunId, TaskId};
use crate::storage::{Storage, StorageError, TaskInstance};

use super::outcome::{RunError, RunSummary};
use super::worker::WorkItem;

pub(crate) struct Evaluator<S> {
    dag: Arc<Dag>,
    storage: Arc<S>,
    run_id: RunId,
    states: HashMap<TaskId, State>,
    /// Upstream tasks of each task that have not succeeded yet.
    unresolved: HashMap<TaskId, usize>,
    success: Vec<TaskId>,
    failed: Vec<TaskId>,
    upstream_failed: Vec<TaskId>,
    errors: Vec<RunError>,
    run_tx: Option<mpsc::Sender<WorkItem>>,
    results: mpsc::UnboundedReceiver<WorkItem>,
    /// Tells the workers to exit once the run is over.
    kill: CancellationToken,
    started: Instant,
}

impl<S: Storage> Evaluator<S> {
    pub(crate) fn new(
        dag: Arc<Dag>,
        storage: Arc<S>,
        run_id: RunId,
        run_tx: mpsc::Sender<WorkItem>,
        results: mpsc::UnboundedReceiver<WorkItem>,
        kill: CancellationToken,
    ) -> Self {
        let states = dag
            .tasks()
            .map(|node| (node.id.clone(), State::Pending))
            .collect();
        let unresolved = dag
            .tasks()
            .map(|node| (node.id.clone(), node.upstream().len()))
            .collect();

        Self {
            dag,
            storage,
            run_id,
            states,
            unresolved,
            success: Vec::new(),
            failed: Vec::new(),
            upstream_failed: Vec::new(),
            errors: Vec::new(),
            run_tx: Some(run_tx),
            results,
            kill,
            started: Instant::now(),
        }
    }

    fn is_done(&self) -> bool {
        self.success.len() + self.failed.len() + self.upstream_failed.len() == self.dag.len()
    }

    /// Drive the run to completion and return its summary.
    pub(crate) async fn run(mut self, cancel: &CancellationToken) -> RunSummary {
        let roots: Vec<TaskId> = self.dag.roots().iter().map(|node| node.id.clone()).collect();
        for id in roots {
            self.enqueue(id).await;
        }

        let mut cancelled = false;
        while !self.is_done() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(run_id = %self.run_id, "run cancelled, abandoning outstanding tasks");
                    cancelled = true;
                    break;
                }
                item = self.results.recv() => match item {
                    Some(item) => self.evaluate(item).await,
                    None => {
                        warn!(run_id = %self.run_id, "all workers exited with tasks outstanding");
                        self.errors.push(RunError::WorkersExited);
                        break;
                    }
                }
            }
        }

        self.finish(cancelled).await
    }

    /// Record a ready task, start its instance and hand it to the workers.
    async fn enqueue(&mut self, id: TaskId) {
        let Ok(node) = self.dag.get_task(&id) else {
            return;
        };
        let task = node.task.clone();
        self.states.insert(id.clone(), State::Queued);

        let mut instance = TaskInstance::new(self.run_id.clone(), id.clone(), task.operator())
            .with_max_tries(task.retries());
        if let Err(e) = self.storage.create_task_instance(instance.clone()).await {
            self.storage_error(&id, "create task instance", e);
        }
        instance.start();
        self.persist(instance.clone()).await;

        let item = WorkItem {
            task_id: id,
            task,
            state: State::Queued,
            instance,
        };
        debug!(task = %item.task.formatted_id(), "sent to workers");

        let rejected = match &self.run_tx {
            Some(tx) => tx.send(item).await.err().map(|e| e.0),
            None => Some(item),
        };
        if let Some(mut item) = rejected {
            item.instance.error = Some("run queue closed before dispatch".into());
            self.fail(item).await;
        }
    }

    async fn evaluate(&mut self, mut item: WorkItem) {
        match item.state {
            State::Success => self.succeed(item).await,
            State::Failed => self.fail(item).await,
            other => {
                warn!(task = %item.task.formatted_id(), state = %other, "worker returned task in a non-terminal state");
                item.instance
                    .error
                    .get_or_insert_with(|| format!("worker returned task in state {other}"));
                self.fail(item).await;
            }
        }
    }

    async fn succeed(&mut self, mut item: WorkItem) {
        item.instance.stop(State::Success);
        info!(task = %item.task.formatted_id(), duration = ?item.instance.duration, "task succeeded");
        self.persist(item.instance).await;
        self.states.insert(item.task_id.clone(), State::Success);
        self.success.push(item.task_id.clone());

        for next in self.downstream_of(&item.task_id) {
            let ready = match self.unresolved.get_mut(&next) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if ready && self.states.get(&next) == Some(&State::Pending) {
                self.enqueue(next).await;
            }
        }
    }

    async fn fail(&mut self, mut item: WorkItem) {
        item.instance.stop(State::Failed);
        warn!(
            task = %item.task.formatted_id(),
            error = item.instance.error.as_deref().unwrap_or(""),
            "task failed"
        );
        self.persist(item.instance).await;
        self.states.insert(item.task_id.clone(), State::Failed);
        self.failed.push(item.task_id.clone());
        self.cascade(&item.task_id).await;
    }

    /// Mark every pending task reachable from `failed` as upstream-failed.
    ///
    /// Tasks already terminal are skipped without descending, so each task
    /// is counted exactly once however many failed ancestors it has.
    async fn cascade(&mut self, failed: &TaskId) {
        let mut queue: VecDeque<TaskId> = self.downstream_of(failed).into();
        while let Some(id) = queue.pop_front() {
            if self.states.get(&id) != Some(&State::Pending) {
                continue;
            }
            self.states.insert(id.clone(), State::UpstreamFailed);
            self.upstream_failed.push(id.clone());

            let operator = self
                .dag
                .get_task(&id)
                .map(|node| node.task.operator())
                .unwrap_or("task");
            let instance = TaskInstance::upstream_failed(self.run_id.clone(), id.clone(), operator);
            if let Err(e) = self.storage.create_task_instance(instance).await {
                self.storage_error(&id, "create task instance", e);
            }
            debug!(task = %id, upstream = %failed, "upstream failed");

            queue.extend(self.downstream_of(&id));
        }
    }

    fn downstream_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.dag
            .downstream(id)
            .map(<[TaskId]>::to_vec)
            .unwrap_or_default()
    }

    async fn persist(&mut self, instance: TaskInstance) {
        let task_id = instance.task_id.clone();
        if let Err(e) = self.storage.update_task_instance(instance).await {
            self.storage_error(&task_id, "update task instance", e);
        }
    }

    fn storage_error(&mut self, task_id: &TaskId, action: &str, source: StorageError) {
        warn!(task_id = %task_id, run_id = %self.run_id, error = %source, "Failed to {}", action);
        self.errors.push(RunError::Storage {
            context: format!("{action} for task {task_id}"),
            source,
        });
    }

    /// Fail every task handed to the workers that never came back, closing
    /// its instance record.
    async fn abandon_outstanding(&mut self) {
        let mut outstanding: Vec<TaskId> = self
            .states
            .iter()
            .filter(|(_, state)| **state == State::Queued)
            .map(|(id, _)| id.clone())
            .collect();
        outstanding.sort();

        for id in outstanding {
            match self.storage.get_task_instance(&self.run_id, &id).await {
                Ok(mut instance) if !instance.state.is_terminal() => {
                    instance.error = Some("run cancelled".into());
                    instance.stop(State::Failed);
                    self.persist(instance).await;
                }
                Ok(_) => {}
                Err(e) => self.storage_error(&id, "load task instance", e),
            }
            debug!(task = %id, "abandoned by cancellation");
            self.states.insert(id.clone(), State::Failed);
            self.failed.push(id);
        }
    }

    async fn finish(mut self, cancelled: bool) -> RunSummary {
        // closing the queue and killing the pool lets every worker return
        self.run_tx.take();
        self.kill.cancel();
        self.results.close();

        if cancelled {
            self.abandon_outstanding().await;
            self.errors.push(RunError::Cancelled(self.run_id.clone()));
        }
        let state = if self.failed.is_empty() && !cancelled && self.is_done() {
            State::Success
        } else {
            State::Failed
        };

        self.success.sort();
        self.failed.sort();
        self.upstream_failed.sort();

        RunSummary {
            run_id: self.run_id,
            dag_id: self.dag.id().clone(),
            state,
            task_states: self.states,
            success: self.success,
            failed: self.failed,
            upstream_failed: self.upstream_failed,
            errors: self.errors,
            duration: self.started.elapsed(),
            cancelled,
        }
    }
}
