//! Operator that runs an external command.
//!
//! The command line is split on whitespace, the first word is the program and
//! the rest are its arguments. No shell is involved, so quoting, pipes and
//! redirections are not interpreted.
//!
//! ```rust
//! use tideflow::BashOperator;
//!
//! let print_date = BashOperator::new("print_date", "date");
//! let sleep = BashOperator::builder("sleep", "sleep 5").retries(3).build();
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::task::{Task, TaskError};

/// Runs a command line as a child process.
///
/// Stdout and stderr are captured. A non-zero exit status fails the task
/// with [`TaskError::CommandFailed`] carrying the captured stderr.
#[derive(Debug, Clone)]
pub struct BashOperator {
    id: String,
    command: String,
    retries: u32,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl BashOperator {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Arc<Self> {
        Self::builder(id, command).build()
    }

    pub fn builder(id: impl Into<String>, command: impl Into<String>) -> BashOperatorBuilder {
        BashOperatorBuilder {
            inner: BashOperator {
                id: id.into(),
                command: command.into(),
                retries: 0,
                env: HashMap::new(),
                working_dir: None,
            },
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }
}

#[async_trait]
impl Task for BashOperator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self) -> Result<(), TaskError> {
        let mut words = self.command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| TaskError::ExecutionFailed("bash command had no args".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(words)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| TaskError::ExecutionFailed(format!("{program}: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        for line in stdout.lines() {
            info!(task = %self.id, "{}", line);
        }
        if !stderr.is_empty() {
            debug!(task = %self.id, stderr = %stderr, "command wrote to stderr");
        }

        if output.status.success() {
            Ok(())
        } else {
            // killed by a signal
            let code = output.status.code().unwrap_or(-1);
            Err(TaskError::CommandFailed { code, stderr })
        }
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn operator(&self) -> &'static str {
        "bash"
    }
}

/// Builder for [`BashOperator`].
pub struct BashOperatorBuilder {
    inner: BashOperator,
}

impl BashOperatorBuilder {
    pub fn retries(mut self, retries: u32) -> Self {
        self.inner.retries = retries;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inner.working_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Arc<BashOperator> {
        Arc::new(self.inner)
    }
}
