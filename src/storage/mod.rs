//! Storage abstraction for DAG metadata, DAG runs and task instances.
//!
//! The orchestrator only talks to the [`Storage`] trait; [`InMemoryStorage`]
//! is the bundled backend. Storage failures never abort a run: callers log
//! them and keep executing.

mod memory;

pub use memory::InMemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::dag::Dag;
use crate::core::state::State;
use crate::core::types::{DagId, RunId, TaskId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Persisted metadata about a registered DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRecord {
    pub id: DagId,
    pub description: String,
    /// Cron expression, `None` for manually triggered DAGs.
    pub schedule: Option<String>,
    /// Paused DAGs are skipped by the heartbeat but can still be triggered.
    pub is_paused: bool,
    /// When the heartbeat last fired this DAG.
    pub last_scheduler_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DagRecord {
    pub fn new(id: DagId) -> Self {
        Self {
            id,
            description: String::new(),
            schedule: None,
            is_paused: false,
            last_scheduler_run: None,
            created_at: Utc::now(),
        }
    }

    /// Snapshot the metadata of an in-memory DAG.
    pub fn from_dag(dag: &Dag) -> Self {
        Self {
            description: dag.description().to_string(),
            schedule: dag.schedule().map(|s| s.expression().to_string()),
            ..Self::new(dag.id().clone())
        }
    }
}

/// One execution of a DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRunRecord {
    pub id: RunId,
    pub dag_id: DagId,
    /// When the run was requested.
    pub execution_date: DateTime<Utc>,
    pub state: State,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl DagRunRecord {
    pub fn new(id: RunId, dag_id: DagId) -> Self {
        Self {
            id,
            dag_id,
            execution_date: Utc::now(),
            state: State::Pending,
            start_date: None,
            end_date: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = State::Running;
        self.start_date = Some(Utc::now());
    }

    /// Record the aggregate outcome of the run.
    pub fn finish(&mut self, state: State) {
        self.state = state;
        self.end_date = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.start_date?, self.end_date?);
        (end - start).to_std().ok()
    }
}

/// The record of one task within one DAG run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub state: State,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub try_number: u32,
    pub max_tries: u32,
    pub operator: String,
    pub error: Option<String>,
}

impl TaskInstance {
    /// A freshly queued instance.
    pub fn new(run_id: RunId, task_id: TaskId, operator: impl Into<String>) -> Self {
        Self {
            run_id,
            task_id,
            state: State::Queued,
            start_date: None,
            end_date: None,
            duration: None,
            try_number: 0,
            max_tries: 0,
            operator: operator.into(),
            error: None,
        }
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// An instance that was never executed because an upstream task failed.
    pub fn upstream_failed(run_id: RunId, task_id: TaskId, operator: impl Into<String>) -> Self {
        let mut instance = Self::new(run_id, task_id, operator);
        instance.state = State::UpstreamFailed;
        instance
    }

    /// Mark the instance as running and stamp its start time.
    pub fn start(&mut self) {
        self.state = State::Running;
        self.try_number += 1;
        self.start_date = Some(Utc::now());
    }

    /// Stamp the end time, compute the duration and set the final state.
    pub fn stop(&mut self, state: State) {
        let end = Utc::now();
        self.state = state;
        self.end_date = Some(end);
        self.duration = self
            .start_date
            .and_then(|start| (end - start).to_std().ok());
    }
}

/// Storage backend trait.
///
/// Implementations must be thread-safe (Send + Sync) as they will be
/// accessed from multiple async tasks concurrently.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Return the stored record for `record.id`, inserting `record` if absent.
    async fn get_or_create_dag(&self, record: DagRecord) -> Result<DagRecord, StorageError>;

    async fn get_dag(&self, id: &DagId) -> Result<DagRecord, StorageError>;

    async fn set_dag_paused(&self, id: &DagId, paused: bool) -> Result<(), StorageError>;

    async fn update_last_scheduler_run(
        &self,
        id: &DagId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn create_dag_run(&self, run: DagRunRecord) -> Result<(), StorageError>;

    async fn get_dag_run(&self, id: &RunId) -> Result<DagRunRecord, StorageError>;

    async fn update_dag_run(&self, run: DagRunRecord) -> Result<(), StorageError>;

    /// Runs of a DAG, most recent first.
    async fn list_dag_runs(&self, dag_id: &DagId) -> Result<Vec<DagRunRecord>, StorageError>;

    async fn create_task_instance(&self, instance: TaskInstance) -> Result<(), StorageError>;

    async fn update_task_instance(&self, instance: TaskInstance) -> Result<(), StorageError>;

    async fn get_task_instance(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<TaskInstance, StorageError>;

    async fn list_task_instances(&self, run_id: &RunId) -> Result<Vec<TaskInstance>, StorageError>;
}
