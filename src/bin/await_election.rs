use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use await_election::config::{RunConfig, Settings};
use await_election::election::ElectionEngine;
use await_election::orchestrator::{run_unelected, Orchestrator};
use await_election::registrar::kube::KubeEndpointsRegistrar;
use await_election::registrar::EndpointRegistrar;
use await_election::store::kube::KubeLeaseStore;
use await_election::RunError;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("await-election {}", env!("CARGO_PKG_VERSION"));

    let code = match run(Settings::parse()).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            e.downcast_ref::<RunError>().map_or(1, RunError::exit_code)
        }
    };
    std::process::exit(code);
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let config = RunConfig::try_from(settings).map_err(RunError::from)?;
    let workload = Arc::new(config.workload);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let Some(elected) = config.election else {
        return Ok(run_unelected(workload, shutdown).await?);
    };

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let store = Arc::new(KubeLeaseStore::new(client.clone()));
    let engine = ElectionEngine::new(elected.identity, elected.lock, elected.timing, store)
        .map_err(RunError::from)?;
    info!("running election '{}' as '{}'", elected.name, engine.identity());

    let mut orchestrator = Orchestrator::new(engine, workload);
    if let Some(service) = elected.service {
        let registrar = Arc::new(KubeEndpointsRegistrar::new(client));
        orchestrator = orchestrator.with_registrar(EndpointRegistrar::new(registrar, service));
    }
    if let Some(addr) = elected.status_endpoint {
        orchestrator = orchestrator.with_status_endpoint(addr);
    }
    Ok(orchestrator.run(shutdown).await?)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
