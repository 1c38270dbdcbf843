use std::process::ExitStatus;

use thiserror::Error;

/// Problems with the startup configuration. Fatal before any loop starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config: missing required environment variable: '{0}'")]
    MissingEnv(&'static str),
    #[error("config: invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("config: need at least one argument to run")]
    MissingCommand,
}

/// Failures reported by a [`CoordinationStore`](crate::store::CoordinationStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The presented version is stale, or the record already exists on create.
    #[error("conflict: record was modified concurrently")]
    Conflict,
    #[error("record not found")]
    NotFound,
    /// Network or server hiccup; the caller retries on its own cadence.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the request and will keep refusing it.
    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether retrying on the next cycle can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Rejected(_))
    }
}

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("coordination store failed permanently: {0}")]
    Store(#[from] StoreError),
    #[error("leadership event consumer went away")]
    EventsClosed,
    #[error("election task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for workload: {0}")]
    Wait(#[source] std::io::Error),
    #[error("workload exited with {0}")]
    Exited(ExitStatus),
    #[error("workload task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("registrar unavailable: {0}")]
    Unavailable(String),
    #[error("registrar rejected endpoint: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum HealthServerError {
    #[error("failed to bind status endpoint '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("status endpoint failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Terminal result of a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("election failed: {0}")]
    Election(#[from] ElectionError),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error("failed to publish service endpoint: {0}")]
    Registrar(#[from] RegistrarError),
    #[error(transparent)]
    HealthServer(#[from] HealthServerError),
    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    /// Process exit code for this error. A workload's own exit code is kept
    /// when it has one.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Workload(WorkloadError::Exited(status)) => match status.code() {
                Some(code) if code != 0 => code,
                _ => 1,
            },
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;
