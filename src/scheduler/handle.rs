//! Scheduler handle for controlling a running scheduler.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::types::{DagId, RunId};

use super::types::{SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Send a command and wait for the scheduler's reply.
    async fn request<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Run a DAG immediately; its cron schedule is unaffected.
    pub async fn trigger(&self, dag_id: impl Into<DagId>) -> Result<RunId, SchedulerError> {
        let dag_id = dag_id.into();
        self.request(
            |response| SchedulerCommand::Trigger { dag_id, response },
            "trigger",
        )
        .await?
    }

    /// Stop firing a DAG from the heartbeat. Manual triggers still work.
    pub async fn pause(&self, dag_id: impl Into<DagId>) -> Result<(), SchedulerError> {
        self.set_paused(dag_id.into(), true).await
    }

    pub async fn unpause(&self, dag_id: impl Into<DagId>) -> Result<(), SchedulerError> {
        self.set_paused(dag_id.into(), false).await
    }

    async fn set_paused(&self, dag_id: DagId, paused: bool) -> Result<(), SchedulerError> {
        self.request(
            |response| SchedulerCommand::SetPaused {
                dag_id,
                paused,
                response,
            },
            if paused { "pause" } else { "unpause" },
        )
        .await?
    }

    /// Stop the scheduler and wait until in-flight runs have drained.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }
}
