use std::sync::Arc;

use crate::job_queue::{JobQueue, PostgresJobQueue};
use crate::memory_queue::MemoryJobQueue;
use crate::store::{MemoryPipelineStore, PipelineStore, PipelineStoreError, PostgresPipelineStore};
use crate::supervisor::Supervisor;

use super::config::{BackendKind, ServiceConfig};
use super::BoxError;

#[derive(Clone)]
pub struct SupervisorState {
    pub supervisor: Arc<Supervisor>,
    pub worker_token: Option<String>,
}

/// Opens the configured store and queue. Postgres connections are blocking,
/// so async callers run this on `spawn_blocking`.
pub fn build_supervisor(config: &ServiceConfig) -> Result<Supervisor, BoxError> {
    let (store, queue): (Arc<dyn PipelineStore>, Arc<dyn JobQueue>) = match config.backend {
        BackendKind::Memory => (
            Arc::new(MemoryPipelineStore::new()),
            Arc::new(MemoryJobQueue::new()),
        ),
        BackendKind::Postgres => {
            let db_url = config
                .db_url
                .as_deref()
                .ok_or(PipelineStoreError::MissingDbUrl)?;
            (
                Arc::new(PostgresPipelineStore::new_from_url(db_url)?),
                Arc::new(PostgresJobQueue::new_from_url(db_url)?),
            )
        }
    };
    Ok(Supervisor::new(store, queue, config.supervisor.clone()))
}
