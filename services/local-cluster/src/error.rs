//! Error types for the local cluster orchestrator.

use std::path::PathBuf;

use thiserror::Error;

use crate::configuration::ConfigError;

/// Errors returned by [`LocalCluster`](crate::LocalCluster).
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A cluster is already running in this process.
    ///
    /// Two clusters would share worker directories and default resources.
    #[error("can only launch one local cluster at a time")]
    AlreadyRunning,

    /// An actor's startup failed. Everything spawned before it has been
    /// stopped again and the cluster is not running.
    #[error("actor {actor} failed to start: {reason}")]
    ActorStart { actor: String, reason: String },

    /// `launch` was called outside a tokio runtime.
    #[error("a local cluster must be launched from within a tokio runtime")]
    NoRuntime,

    /// The configuration could not be translated into actor settings.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A work directory could not be prepared.
    #[error("failed to prepare work directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClusterError {
    /// Short machine-readable code, used as a log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ClusterError::AlreadyRunning => "already_running",
            ClusterError::ActorStart { .. } => "actor_start_failed",
            ClusterError::NoRuntime => "no_runtime",
            ClusterError::Config(_) => "config_invalid",
            ClusterError::WorkDir { .. } => "work_dir_failed",
        }
    }
}
