//! Runtime settings loaded from YAML.

mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{CoreSettings, SchedulerSettings, Settings};
