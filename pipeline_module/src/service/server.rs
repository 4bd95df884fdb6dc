use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use tokio::task;
use tracing::info;

use super::config::ServiceConfig;
use super::handlers::{health, run_supervisor_sweep};
use super::state::{build_supervisor, SupervisorState};
use super::BoxError;

pub fn build_router(state: SupervisorState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/pipeline-supervisor", any(run_supervisor_sweep))
        .with_state(state)
}

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let backend_config = config.clone();
    let supervisor = task::spawn_blocking(move || build_supervisor(&backend_config))
        .await
        .map_err(|err| -> BoxError { err.into() })??;
    if config.worker_token.is_none() {
        info!("PIPELINE_WORKER_TOKEN is not set; every sweep trigger will be rejected");
    }
    let state = SupervisorState {
        supervisor: Arc::new(supervisor),
        worker_token: config.worker_token.clone(),
    };

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!(
        "pipeline supervisor listening on {} backend={} db_url=***",
        addr, config.backend
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
