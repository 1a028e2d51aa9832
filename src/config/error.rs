//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading or validating configuration.
///
/// At startup any of these is fatal; at reload time they are logged and the
/// previous configuration stays active.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file is empty")]
    Empty,

    #[error("environment variable '{var}' referenced by the configuration is not set")]
    MissingEnvVar { var: String },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_saphyr::Error),

    #[error("route '{path}': {reason}")]
    InvalidRoute { path: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}
