//! Orchestrator settings.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration:
//!
//! ```yaml
//! core:
//!   parallelism: 32
//!   dag_concurrency: 16
//!   default_timezone: UTC
//! scheduler:
//!   heartbeat_secs: 5
//!   shutdown_timeout_secs: 30
//! ```

use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Top-level settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub core: CoreSettings,
    pub scheduler: SchedulerSettings,
}

/// Execution limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Upper bound on tasks of a single run executing at once.
    pub parallelism: usize,
    /// Upper bound on DAG runs executing at once.
    pub dag_concurrency: usize,
    /// Timezone applied to cron expressions that do not name one.
    pub default_timezone: String,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            parallelism: 32,
            dag_concurrency: 16,
            default_timezone: "UTC".to_string(),
        }
    }
}

/// Scheduler loop timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between heartbeat scans of the next-fire table.
    pub heartbeat_secs: u64,
    /// Seconds to wait for in-flight runs after shutdown is requested.
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 5,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Load and validate settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let settings: Settings =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write these settings to `path`, replacing any existing file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_yaml()?).map_err(|source| ConfigError::FileWriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core.parallelism == 0 {
            return Err(ConfigError::InvalidConfig(
                "core.parallelism must be greater than zero".into(),
            ));
        }
        if self.core.dag_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "core.dag_concurrency must be greater than zero".into(),
            ));
        }
        if self.scheduler.heartbeat_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduler.heartbeat_secs must be greater than zero".into(),
            ));
        }
        self.default_timezone()?;
        Ok(())
    }

    /// The parsed `core.default_timezone`.
    pub fn default_timezone(&self) -> Result<Tz, ConfigError> {
        self.core.default_timezone.parse().map_err(|_| {
            ConfigError::InvalidConfig(format!(
                "core.default_timezone '{}' is not a known timezone",
                self.core.default_timezone
            ))
        })
    }

    pub fn with_default_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.core.default_timezone = timezone.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.core.parallelism = parallelism;
        self
    }

    pub fn with_dag_concurrency(mut self, dag_concurrency: usize) -> Self {
        self.core.dag_concurrency = dag_concurrency;
        self
    }

    pub fn with_heartbeat_secs(mut self, secs: u64) -> Self {
        self.scheduler.heartbeat_secs = secs;
        self
    }

    pub fn with_shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.scheduler.shutdown_timeout_secs = secs;
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.scheduler.heartbeat_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.shutdown_timeout_secs)
    }
}
