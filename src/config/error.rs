//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when loading, writing or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a settings file.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a settings file.
    #[error("failed to write file '{path}': {source}")]
    FileWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse or emit YAML.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
