use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::config::{resolve_string_env, SupervisorConfig, SupervisorConfigFile};
use crate::pg::resolve_db_url;

use super::BoxError;

pub const DEFAULT_SUPERVISOR_HOST: &str = "0.0.0.0";
pub const DEFAULT_SUPERVISOR_PORT: u16 = 9200;

#[derive(Debug, Deserialize, Default)]
pub struct ServiceConfigFile {
    #[serde(default)]
    pub server: ServerConfigFile,
    #[serde(default)]
    pub supervisor: SupervisorConfigFile,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerConfigFile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backend: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Postgres => f.write_str("postgres"),
            BackendKind::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "supabase" => Ok(BackendKind::Postgres),
            "memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown pipeline backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub db_url: Option<String>,
    pub worker_token: Option<String>,
    pub supervisor: SupervisorConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        let file = match resolve_service_config_path() {
            Some(path) => load_service_config_file(&path)?,
            None => ServiceConfigFile::default(),
        };
        Self::from_file_and_env(file)
    }

    pub fn from_file_and_env(file: ServiceConfigFile) -> Result<Self, BoxError> {
        let host = resolve_string_env("SUPERVISOR_HOST")
            .or(file.server.host)
            .unwrap_or_else(|| DEFAULT_SUPERVISOR_HOST.to_string());
        let port = env::var("SUPERVISOR_PORT")
            .ok()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .or(file.server.port)
            .unwrap_or(DEFAULT_SUPERVISOR_PORT);
        let backend = resolve_string_env("PIPELINE_BACKEND")
            .or(file.server.backend)
            .map(|value| value.parse::<BackendKind>())
            .transpose()?
            .unwrap_or(BackendKind::Postgres);

        Ok(Self {
            host,
            port,
            backend,
            db_url: resolve_db_url(),
            worker_token: resolve_string_env("PIPELINE_WORKER_TOKEN"),
            supervisor: SupervisorConfig::from_file_and_env(&file.supervisor),
        })
    }
}

/// `SUPERVISOR_CONFIG_PATH`, else `pipeline_supervisor.toml` in the working
/// directory when present.
pub fn resolve_service_config_path() -> Option<PathBuf> {
    if let Some(path) = resolve_string_env("SUPERVISOR_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }
    let direct = env::current_dir().ok()?.join("pipeline_supervisor.toml");
    direct.exists().then_some(direct)
}

pub fn load_service_config_file(path: &Path) -> Result<ServiceConfigFile, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read supervisor config: {}", err))?;
    toml::from_str::<ServiceConfigFile>(&content)
        .map_err(|err| format!("failed to parse supervisor config: {}", err))
}
