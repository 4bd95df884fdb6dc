use pipeline_module::service::{run_server, BoxError, ServiceConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env()?;
    info!(
        "pipeline supervisor config: stalled_run_minutes={} stalled_event_minutes={} nudge_limit={}",
        config.supervisor.stalled_run_minutes,
        config.supervisor.stalled_event_minutes,
        config.supervisor.nudge_limit
    );
    run_server(config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("pipeline supervisor shutting down");
    })
    .await
}
