//! Tiny healthz surface so the controller's own liveness can be probed by
//! the orchestrator — just the one route, since the controller's REST
//! surface is otherwise out of scope.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct HealthzState {
    healthy: Arc<RwLock<bool>>,
}

async fn healthz(State(state): State<HealthzState>) -> StatusCode {
    if *state.healthy.read().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn router(healthy: Arc<RwLock<bool>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(HealthzState { healthy })
}

pub async fn serve(port: u16, healthy: Arc<RwLock<bool>>, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind healthz port {port}: {e}");
            return;
        }
    };
    tracing::info!("healthz listening on http://{addr}");

    axum::serve(listener, router(healthy))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .ok();
}
