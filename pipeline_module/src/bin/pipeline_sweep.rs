use std::process::ExitCode;
use std::time::Instant;

use pipeline_module::service::{build_supervisor, sweep_report, ServiceConfig};
use tracing::error;

/// Runs one supervisor sweep and prints the trigger's JSON body.
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    dotenvy::dotenv().ok();
    let started = Instant::now();

    let supervisor = match ServiceConfig::from_env().and_then(|config| build_supervisor(&config)) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("pipeline sweep setup failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let (status, body) = sweep_report(&supervisor, started);
    println!("{}", body);
    if status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
