mod auth;
mod config;
mod handlers;
mod server;
mod state;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{
    load_service_config_file, resolve_service_config_path, BackendKind, ServiceConfig,
    ServiceConfigFile, DEFAULT_SUPERVISOR_PORT,
};
pub use handlers::sweep_report;
pub use server::{build_router, run_server};
pub use state::{build_supervisor, SupervisorState};
