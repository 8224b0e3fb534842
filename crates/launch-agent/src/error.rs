//! Error types for the launch agent.

use thiserror::Error;

use crate::cluster::watch::WatchError;
use crate::queue::QueueError;

/// Errors raised while launching or supervising a job.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Secure mode rejected a field the launch spec tried to override
    #[error("{0}")]
    SecureMode(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Queue service error: {0}")]
    Queue(#[from] QueueError),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("No runner registered for resource: {0}")]
    UnsupportedResource(String),

    #[error("Run {run_id} did not stop within {timeout_secs}s of the stop request")]
    StopTimeout { run_id: String, timeout_secs: u64 },

    #[error("Job task panicked: {0}")]
    Panicked(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors detected while loading or validating agent configuration.
///
/// These are fatal: the agent refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value:?} (expected a non-negative integer or -1 for unlimited)")]
    InvalidLimit { field: &'static str, value: String },

    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for environment variable {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

pub type Result<T, E = LaunchError> = std::result::Result<T, E>;
