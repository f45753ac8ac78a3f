//! Testing utilities for code built on tideflow.
//!
//! - [`TestTask`]: a configurable task that can sleep, fail, panic and record
//!   what it did
//! - [`ConcurrencyProbe`]: tracks how many probed tasks run at once
//! - [`ExecutionLog`]: ordered record of task starts and finishes
//! - [`FaultyStorage`]: an in-memory store with injectable failures
//! - [`TestHarness`]: runs a DAG once against in-memory storage

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::core::dag::Dag;
use crate::core::state::State;
use crate::core::task::{Task, TaskError};
use crate::core::types::{DagId, RunId, TaskId};
use crate::execution::{RunSummary, TaskRunner};
use crate::storage::{
    DagRecord, DagRunRecord, InMemoryStorage, Storage, StorageError, TaskInstance,
};

/// Counts concurrent entries across every task sharing the probe.
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    inner: Arc<ProbeCounters>,
}

#[derive(Default)]
struct ProbeCounters {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry; the returned guard registers the exit on drop.
    pub fn enter(&self) -> ProbeGuard {
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max.fetch_max(now, Ordering::SeqCst);
        self.inner.total.fetch_add(1, Ordering::SeqCst);
        ProbeGuard {
            inner: self.inner.clone(),
        }
    }

    /// Highest number of simultaneous entries observed.
    pub fn max(&self) -> usize {
        self.inner.max.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard {
    inner: Arc<ProbeCounters>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.inner.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared, ordered list of `"<task>:start"` / `"<task>:end"` entries.
#[derive(Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }
}

/// A task whose behavior is configured by [`TestTaskBuilder`].
pub struct TestTask {
    id: String,
    sleep: Option<Duration>,
    failure: Option<String>,
    panics: bool,
    retries: u32,
    probe: Option<ConcurrencyProbe>,
    log: Option<ExecutionLog>,
    runs: AtomicUsize,
}

impl TestTask {
    /// Start configuring a task that succeeds immediately.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(id: impl Into<String>) -> TestTaskBuilder {
        TestTaskBuilder {
            task: TestTask {
                id: id.into(),
                sleep: None,
                failure: None,
                panics: false,
                retries: 0,
                probe: None,
                log: None,
                runs: AtomicUsize::new(0),
            },
        }
    }

    /// How many times the task body has been entered.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for TestTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self) -> Result<(), TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let _guard = self.probe.as_ref().map(ConcurrencyProbe::enter);
        if let Some(log) = &self.log {
            log.record(format!("{}:start", self.id));
        }

        if let Some(duration) = self.sleep {
            tokio::time::sleep(duration).await;
        }
        if self.panics {
            panic!("{} panicked on purpose", self.id);
        }

        if let Some(log) = &self.log {
            log.record(format!("{}:end", self.id));
        }
        match &self.failure {
            Some(message) => Err(TaskError::ExecutionFailed(message.clone())),
            None => Ok(()),
        }
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn operator(&self) -> &'static str {
        "test"
    }
}

pub struct TestTaskBuilder {
    task: TestTask,
}

impl TestTaskBuilder {
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.task.sleep = Some(duration);
        self
    }

    /// Fail every run with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.task.failure = Some(message.into());
        self
    }

    pub fn panicking(mut self) -> Self {
        self.task.panics = true;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.task.retries = retries;
        self
    }

    pub fn probe(mut self, probe: &ConcurrencyProbe) -> Self {
        self.task.probe = Some(probe.clone());
        self
    }

    pub fn log(mut self, log: &ExecutionLog) -> Self {
        self.task.log = Some(log.clone());
        self
    }

    pub fn build(self) -> Arc<TestTask> {
        Arc::new(self.task)
    }
}

/// In-memory storage with switchable faults.
#[derive(Default)]
pub struct FaultyStorage {
    inner: InMemoryStorage,
    fail_task_instances: bool,
    panic_on_create_run: bool,
}

impl FaultyStorage {
    /// Every task-instance write returns an error.
    pub fn failing_task_instances() -> Self {
        Self {
            fail_task_instances: true,
            ..Self::default()
        }
    }

    /// Creating a DAG run record panics.
    pub fn panicking_on_create_run() -> Self {
        Self {
            panic_on_create_run: true,
            ..Self::default()
        }
    }

    fn instance_fault(&self) -> Result<(), StorageError> {
        if self.fail_task_instances {
            return Err(StorageError::Other("injected task instance failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn get_or_create_dag(&self, record: DagRecord) -> Result<DagRecord, StorageError> {
        self.inner.get_or_create_dag(record).await
    }

    async fn get_dag(&self, id: &DagId) -> Result<DagRecord, StorageError> {
        self.inner.get_dag(id).await
    }

    async fn set_dag_paused(&self, id: &DagId, paused: bool) -> Result<(), StorageError> {
        self.inner.set_dag_paused(id, paused).await
    }

    async fn update_last_scheduler_run(
        &self,
        id: &DagId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inner.update_last_scheduler_run(id, at).await
    }

    async fn create_dag_run(&self, run: DagRunRecord) -> Result<(), StorageError> {
        if self.panic_on_create_run {
            panic!("injected panic creating run {}", run.id);
        }
        self.inner.create_dag_run(run).await
    }

    async fn get_dag_run(&self, id: &RunId) -> Result<DagRunRecord, StorageError> {
        self.inner.get_dag_run(id).await
    }

    async fn update_dag_run(&self, run: DagRunRecord) -> Result<(), StorageError> {
        self.inner.update_dag_run(run).await
    }

    async fn list_dag_runs(&self, dag_id: &DagId) -> Result<Vec<DagRunRecord>, StorageError> {
        self.inner.list_dag_runs(dag_id).await
    }

    async fn create_task_instance(&self, instance: TaskInstance) -> Result<(), StorageError> {
        self.instance_fault()?;
        self.inner.create_task_instance(instance).await
    }

    async fn update_task_instance(&self, instance: TaskInstance) -> Result<(), StorageError> {
        self.instance_fault()?;
        self.inner.update_task_instance(instance).await
    }

    async fn get_task_instance(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<TaskInstance, StorageError> {
        self.inner.get_task_instance(run_id, task_id).await
    }

    async fn list_task_instances(&self, run_id: &RunId) -> Result<Vec<TaskInstance>, StorageError> {
        self.inner.list_task_instances(run_id).await
    }
}

/// Runs DAGs once against a fresh in-memory store.
pub struct TestHarness {
    storage: Arc<InMemoryStorage>,
    parallelism: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            parallelism: 4,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    /// Execute one run of `dag`.
    ///
    /// # Panics
    ///
    /// Panics if the DAG or parallelism is rejected by [`TaskRunner::new`].
    pub async fn run(&self, dag: Dag) -> RunSummary {
        let runner = match TaskRunner::new(Arc::new(dag), self.storage.clone(), self.parallelism) {
            Ok(runner) => runner,
            Err(e) => panic!("test DAG rejected: {e}"),
        };
        runner.run(RunId::new(), CancellationToken::new()).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll storage until a run reaches `expected`.
///
/// # Panics
///
/// Panics if the state is not reached within `timeout`.
pub async fn wait_for_run_state<S: Storage + ?Sized>(
    storage: &S,
    run_id: &RunId,
    expected: State,
    timeout: Duration,
) -> DagRunRecord {
    let start = tokio::time::Instant::now();
    loop {
        let current = storage.get_dag_run(run_id).await.ok();
        if let Some(run) = &current {
            if run.state == expected {
                return run.clone();
            }
        }
        if start.elapsed() > timeout {
            panic!(
                "timeout waiting for run {} to reach {}, current: {:?}",
                run_id,
                expected,
                current.map(|r| r.state)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
