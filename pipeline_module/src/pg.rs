use std::env;
use std::time::Duration;

use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::error;

use crate::config::resolve_bool_env;

pub(crate) type PgPool = Pool<PostgresConnectionManager<MakeTlsConnector>>;
pub(crate) type PgConnection = PooledConnection<PostgresConnectionManager<MakeTlsConnector>>;

#[derive(Debug)]
struct LoggingErrorHandler {
    label: &'static str,
}

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("{} postgres pool error: {:?}", self.label, err);
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PoolBuildError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("tls error: {0}")]
    Tls(String),
}

pub(crate) fn build_pool(
    db_url: &str,
    max_size: u32,
    label: &'static str,
) -> Result<PgPool, PoolBuildError> {
    let config: postgres::Config = db_url.parse()?;
    let mut tls_builder = native_tls::TlsConnector::builder();
    if resolve_bool_env("PIPELINE_DB_TLS_ALLOW_INVALID_CERTS") {
        tls_builder.danger_accept_invalid_certs(true);
        tls_builder.danger_accept_invalid_hostnames(true);
    }
    let tls_connector = tls_builder
        .build()
        .map_err(|err| PoolBuildError::Tls(err.to_string()))?;
    let tls = MakeTlsConnector::new(tls_connector);

    let manager = PostgresConnectionManager::new(config, tls);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_secs(5))
        .idle_timeout(Some(Duration::from_secs(300)))
        .error_handler(Box::new(LoggingErrorHandler { label }))
        .build(manager)?;
    Ok(pool)
}

pub(crate) fn resolve_db_url() -> Option<String> {
    ["PIPELINE_DB_URL", "SUPABASE_DB_URL", "DATABASE_URL"]
        .iter()
        .find_map(|key| env::var(key).ok().filter(|value| !value.trim().is_empty()))
}

/// Accepts `name` or `schema.name`, alphanumerics and underscores only.
pub(crate) fn is_valid_table_name(raw: &str) -> bool {
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        !part.is_empty()
            && part
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    })
}

/// Sync postgres connections own a tokio runtime, which panics when dropped
/// from inside an async context, so pools are dropped on a plain thread.
pub(crate) fn drop_pool_off_thread(pool: Option<PgPool>) {
    if let Some(pool) = pool {
        std::thread::spawn(move || drop(pool));
    }
}
