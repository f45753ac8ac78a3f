//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for tests, demos and deployments
//! that do not need history to survive a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{DagRecord, DagRunRecord, Storage, StorageError, TaskInstance};
use crate::core::types::{DagId, RunId, TaskId};

/// In-memory storage backend.
pub struct InMemoryStorage {
    dags: RwLock<HashMap<DagId, DagRecord>>,
    runs: RwLock<HashMap<RunId, DagRunRecord>>,
    instances: RwLock<HashMap<(RunId, TaskId), TaskInstance>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            dags: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_or_create_dag(&self, record: DagRecord) -> Result<DagRecord, StorageError> {
        let mut dags = self.dags.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(dags.entry(record.id.clone()).or_insert(record).clone())
    }

    async fn get_dag(&self, id: &DagId) -> Result<DagRecord, StorageError> {
        let dags = self.dags.read().map_err(|_| StorageError::LockPoisoned)?;
        dags.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("dag: {}", id)))
    }

    async fn set_dag_paused(&self, id: &DagId, paused: bool) -> Result<(), StorageError> {
        let mut dags = self.dags.write().map_err(|_| StorageError::LockPoisoned)?;
        let record = dags
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("dag: {}", id)))?;
        record.is_paused = paused;
        Ok(())
    }

    async fn update_last_scheduler_run(
        &self,
        id: &DagId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut dags = self.dags.write().map_err(|_| StorageError::LockPoisoned)?;
        let record = dags
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("dag: {}", id)))?;
        record.last_scheduler_run = Some(at);
        Ok(())
    }

    async fn create_dag_run(&self, run: DagRunRecord) -> Result<(), StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        if runs.contains_key(&run.id) {
            return Err(StorageError::DuplicateKey(format!("dag run: {}", run.id)));
        }
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_dag_run(&self, id: &RunId) -> Result<DagRunRecord, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        runs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("dag run: {}", id)))
    }

    async fn update_dag_run(&self, run: DagRunRecord) -> Result<(), StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        if !runs.contains_key(&run.id) {
            return Err(StorageError::NotFound(format!("dag run: {}", run.id)));
        }
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn list_dag_runs(&self, dag_id: &DagId) -> Result<Vec<DagRunRecord>, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| &r.dag_id == dag_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.execution_date.cmp(&a.execution_date));
        Ok(result)
    }

    async fn create_task_instance(&self, instance: TaskInstance) -> Result<(), StorageError> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let key = (instance.run_id.clone(), instance.task_id.clone());
        if instances.contains_key(&key) {
            return Err(StorageError::DuplicateKey(format!(
                "task instance: {}/{}",
                key.0, key.1
            )));
        }
        instances.insert(key, instance);
        Ok(())
    }

    async fn update_task_instance(&self, instance: TaskInstance) -> Result<(), StorageError> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let key = (instance.run_id.clone(), instance.task_id.clone());
        if !instances.contains_key(&key) {
            return Err(StorageError::NotFound(format!(
                "task instance: {}/{}",
                key.0, key.1
            )));
        }
        instances.insert(key, instance);
        Ok(())
    }

    async fn get_task_instance(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<TaskInstance, StorageError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        instances
            .get(&(run_id.clone(), task_id.clone()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("task instance: {}/{}", run_id, task_id)))
    }

    async fn list_task_instances(&self, run_id: &RunId) -> Result<Vec<TaskInstance>, StorageError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = instances
            .values()
            .filter(|i| &i.run_id == run_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(result)
    }
}
