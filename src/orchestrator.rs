//! Wires the election engine, the workload supervisor, the endpoint registrar
//! and the status endpoint into one run.

use std::future::pending;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::election::{ElectionEngine, LeadershipEvent};
use crate::error::{ElectionError, HealthServerError, RunError};
use crate::health::HealthServer;
use crate::registrar::EndpointRegistrar;
use crate::supervisor::{Supervisor, SupervisorError, Workload};

const EVENT_BUFFER: usize = 16;

pub struct Orchestrator {
    engine: ElectionEngine,
    supervisor: Supervisor,
    registrar: EndpointRegistrar,
    health: Option<HealthServer>,
}

impl Orchestrator {
    pub fn new(engine: ElectionEngine, workload: Arc<dyn Workload>) -> Self {
        Self {
            engine,
            supervisor: Supervisor::new(workload),
            registrar: EndpointRegistrar::disabled(),
            health: None,
        }
    }

    /// Publish this instance's endpoint each time leadership is gained,
    /// before the workload starts.
    pub fn with_registrar(mut self, registrar: EndpointRegistrar) -> Self {
        self.registrar = registrar;
        self
    }

    /// Serve the engine's health on `addr` for the whole run.
    pub fn with_status_endpoint(mut self, addr: impl Into<String>) -> Self {
        let status = self.engine.subscribe();
        let renew_deadline = self.engine.config().renew_deadline;
        self.health = Some(HealthServer::new(addr, status, renew_deadline));
        self
    }

    /// Run until the workload finishes, a component fails fatally, or
    /// `shutdown` is cancelled.
    ///
    /// Whatever ends the run, the workload is stopped and the engine is given
    /// the chance to release the lease before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RunError> {
        let root = shutdown.child_token();
        let (tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let mut engine_task = Some(tokio::spawn(self.engine.run(tx, root.clone())));
        let mut health_task = self.health.map(|h| tokio::spawn(h.run(root.clone())));
        let registrar = self.registrar;
        let mut supervisor = self.supervisor;

        let result = loop {
            tokio::select! {
                _ = root.cancelled() => break Err(RunError::Cancelled),
                event = events.recv() => match event {
                    Some(LeadershipEvent::Gained(leadership)) => {
                        // A previous term's workload must be gone first.
                        supervisor.on_lost().await;
                        if leadership.is_lost() {
                            debug!("skipping a leadership term that already ended");
                            continue;
                        }
                        let term = leadership.scope();
                        let published = tokio::select! {
                            published = registrar.publish() => published,
                            _ = term.cancelled() => {
                                debug!("leadership ended while publishing the endpoint");
                                continue;
                            }
                            _ = root.cancelled() => break Err(RunError::Cancelled),
                            served = join_health(&mut health_task) => break served,
                        };
                        if let Err(e) = published {
                            break Err(e.into());
                        }
                        match supervisor.on_gained(&leadership) {
                            Ok(()) => {}
                            Err(SupervisorError::LeadershipLost) => {
                                debug!("leadership ended before the workload started");
                            }
                            Err(e) => warn!("workload not started: {}", e),
                        }
                    }
                    Some(LeadershipEvent::Lost(reason)) => {
                        info!("leader lost: {}", reason);
                        supervisor.on_lost().await;
                    }
                    Some(LeadershipEvent::NewLeaderObserved(identity)) => {
                        debug!("following leader '{}'", identity);
                    }
                    None => break join_engine(&mut engine_task).await,
                },
                exit = supervisor.next_exit() => break exit.map_err(RunError::from),
                served = join_health(&mut health_task) => break served,
            }
        };

        root.cancel();
        supervisor.on_lost().await;
        // The engine may still send a final event; let those sends fail.
        drop(events);
        if let Err(e) = join_engine(&mut engine_task).await {
            if !matches!(e, RunError::Cancelled) {
                warn!("election stopped with an error: {}", e);
            }
        }
        if health_task.is_some() {
            if let Err(e) = join_health(&mut health_task).await {
                warn!("status endpoint stopped with an error: {}", e);
            }
        }
        result
    }
}

/// Run `workload` once without any election.
pub async fn run_unelected(
    workload: Arc<dyn Workload>,
    shutdown: CancellationToken,
) -> Result<(), RunError> {
    info!("leader election disabled, running the command directly");
    let result = workload.run(shutdown.child_token()).await;
    if shutdown.is_cancelled() {
        return Err(RunError::Cancelled);
    }
    result.map_err(RunError::from)
}

/// Outcome of the engine task. `Ok` from the engine only happens on shutdown.
async fn join_engine(
    task: &mut Option<JoinHandle<Result<(), ElectionError>>>,
) -> Result<(), RunError> {
    let Some(handle) = task.take() else {
        return Err(RunError::Cancelled);
    };
    match handle.await {
        Ok(Ok(())) => Err(RunError::Cancelled),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(ElectionError::Task(e.to_string()).into()),
    }
}

/// Outcome of the status endpoint. Never resolves when there is none.
async fn join_health(
    task: &mut Option<JoinHandle<Result<(), HealthServerError>>>,
) -> Result<(), RunError> {
    let Some(handle) = task.as_mut() else {
        return pending().await;
    };
    let joined = handle.await;
    *task = None;
    match joined {
        Ok(Ok(())) => Err(RunError::Cancelled),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(HealthServerError::Serve(std::io::Error::other(e.to_string())).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkloadError;
    use async_trait::async_trait;

    struct Immediate(bool);

    #[async_trait]
    impl Workload for Immediate {
        async fn run(&self, _scope: CancellationToken) -> Result<(), WorkloadError> {
            if self.0 {
                Ok(())
            } else {
                Err(WorkloadError::Task("boom".into()))
            }
        }
    }

    #[tokio::test]
    async fn unelected_run_returns_workload_result() {
        let shutdown = CancellationToken::new();
        assert!(run_unelected(Arc::new(Immediate(true)), shutdown.clone())
            .await
            .is_ok());
        assert!(matches!(
            run_unelected(Arc::new(Immediate(false)), shutdown).await,
            Err(RunError::Workload(WorkloadError::Task(_)))
        ));
    }

    #[tokio::test]
    async fn unelected_run_reports_cancellation() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(matches!(
            run_unelected(Arc::new(Immediate(true)), shutdown).await,
            Err(RunError::Cancelled)
        ));
    }
}
