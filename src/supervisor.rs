//! Leadership-driven supervision of the governed workload.

use std::future::pending;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::election::Leadership;
use crate::error::WorkloadError;

/// Something that runs only while this instance may run it.
///
/// Implementations must return soon after `scope` is cancelled.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    async fn run(&self, scope: CancellationToken) -> Result<(), WorkloadError>;
}

/// An external command sharing this process's stdout and stderr.
#[derive(Debug, Clone)]
pub struct CommandWorkload {
    program: String,
    args: Vec<String>,
    termination_grace: Duration,
}

impl CommandWorkload {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            termination_grace: Duration::ZERO,
        }
    }

    /// Build from a `command [args...]` list. `None` if the list is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    /// Time between SIGTERM and SIGKILL on cancellation. Zero kills at once.
    pub fn termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn terminate(&self, child: &mut Child) -> Result<ExitStatus, WorkloadError> {
        #[cfg(unix)]
        {
            let pid = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok());
            if let Some(pid) = pid.filter(|_| !self.termination_grace.is_zero()) {
                // SAFETY: `pid` is our own child and has not been reaped yet.
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
                if let Ok(status) = tokio::time::timeout(self.termination_grace, child.wait()).await {
                    return status.map_err(WorkloadError::Wait);
                }
                warn!(
                    "'{}' did not exit within {:?}, killing it",
                    self.program, self.termination_grace
                );
            }
        }
        child.kill().await.map_err(WorkloadError::Wait)?;
        child.wait().await.map_err(WorkloadError::Wait)
    }
}

#[async_trait]
impl Workload for CommandWorkload {
    async fn run(&self, scope: CancellationToken) -> Result<(), WorkloadError> {
        info!(
            "starting command '{}' with arguments: '{:?}'",
            self.program, self.args
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkloadError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let status = tokio::select! {
            status = child.wait() => status.map_err(WorkloadError::Wait)?,
            _ = scope.cancelled() => {
                info!("stopping '{}'", self.program);
                self.terminate(&mut child).await?
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(WorkloadError::Exited(status))
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("a workload is still running")]
    AlreadyRunning,
    #[error("leadership was lost before the workload started")]
    LeadershipLost,
}

struct Running {
    scope: CancellationToken,
    handle: JoinHandle<Result<(), WorkloadError>>,
}

/// Starts the workload when leadership is gained and stops it when it is lost.
/// At most one workload instance exists at a time.
pub struct Supervisor {
    workload: Arc<dyn Workload>,
    running: Option<Running>,
}

impl Supervisor {
    pub fn new(workload: Arc<dyn Workload>) -> Self {
        Self {
            workload,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start the workload in a scope that ends with `leadership`.
    pub fn on_gained(&mut self, leadership: &Leadership) -> Result<(), SupervisorError> {
        if self.running.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        if leadership.is_lost() {
            return Err(SupervisorError::LeadershipLost);
        }
        let scope = leadership.scope();
        let workload = Arc::clone(&self.workload);
        let task_scope = scope.clone();
        let handle = tokio::spawn(async move { workload.run(task_scope).await });
        self.running = Some(Running { scope, handle });
        Ok(())
    }

    /// Cancel the workload and wait until it is gone. Its result is not the
    /// cause of anything, so it is only logged.
    pub async fn on_lost(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.scope.cancel();
        log_stopped(flatten(running.handle.await));
    }

    /// Result of a workload that ended on its own. Never resolves while idle,
    /// nor for a workload that ended because its scope was cancelled.
    ///
    /// Cancel safe: dropping the future keeps the workload supervised.
    pub async fn next_exit(&mut self) -> Result<(), WorkloadError> {
        let Some(running) = self.running.as_mut() else {
            return pending().await;
        };
        let result = flatten((&mut running.handle).await);
        let stopped = running.scope.is_cancelled();
        self.running = None;
        if stopped {
            log_stopped(result);
            return pending().await;
        }
        result
    }
}

fn log_stopped(result: Result<(), WorkloadError>) {
    match result {
        Ok(()) => info!("workload stopped"),
        Err(e) => info!("workload stopped after losing leadership: {}", e),
    }
}

fn flatten(
    joined: Result<Result<(), WorkloadError>, tokio::task::JoinError>,
) -> Result<(), WorkloadError> {
    joined.unwrap_or_else(|e| Err(WorkloadError::Task(e.to_string())))
}
