//! Status endpoint for liveness checks.
//!
//! Every request answers with the engine's current freshness: `200
//! {"status":"ok"}`, or `500 {"status":"expired"}` when this instance still
//! believes it leads but has not renewed within the renew deadline.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use log::{error, info};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::election::{ElectionStatus, HealthReport};
use crate::error::HealthServerError;

#[derive(Clone)]
struct HealthState {
    status: watch::Receiver<ElectionStatus>,
    renew_deadline: Duration,
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

pub struct HealthServer {
    addr: String,
    state: HealthState,
}

impl HealthServer {
    /// `addr` may omit the host (`":9999"`) to listen on all interfaces.
    pub fn new(
        addr: impl Into<String>,
        status: watch::Receiver<ElectionStatus>,
        renew_deadline: Duration,
    ) -> Self {
        Self {
            addr: addr.into(),
            state: HealthState {
                status,
                renew_deadline,
            },
        }
    }

    pub async fn bind(self) -> Result<BoundHealthServer, HealthServerError> {
        let addr = listen_addr(&self.addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HealthServerError::Bind { addr, source })?;
        let router = Router::new()
            .route("/", get(status))
            .fallback(status)
            .with_state(self.state);
        Ok(BoundHealthServer { listener, router })
    }

    /// Bind and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), HealthServerError> {
        self.bind().await?.serve(shutdown).await
    }
}

pub struct BoundHealthServer {
    listener: TcpListener,
    router: Router,
}

impl BoundHealthServer {
    pub fn local_addr(&self) -> Result<SocketAddr, HealthServerError> {
        self.listener.local_addr().map_err(HealthServerError::Serve)
    }

    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), HealthServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("serving election status on {}", addr);
        }
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(HealthServerError::Serve)
    }
}

async fn status(State(state): State<HealthState>) -> impl IntoResponse {
    let report = state
        .status
        .borrow()
        .health(state.renew_deadline, Instant::now());
    match report {
        HealthReport::Ok => (StatusCode::OK, Json(StatusBody { status: "ok" })),
        HealthReport::Stale => {
            error!("lease renewal overdue, reporting unhealthy status");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StatusBody { status: "expired" }),
            )
        }
    }
}

fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
