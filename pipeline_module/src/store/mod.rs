use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::classification::ConversationCursor;
use crate::incident::{IncidentQuery, NewIncident};
use crate::message_event::{EventStatus, EventTransition, MessageEvent, NewMessageEvent};
use crate::run_tracker::{MetricsPatch, NewRun, PipelineRun, RunState};

mod memory_store;
mod postgres_store;
mod schema;

pub use memory_store::MemoryPipelineStore;
pub use postgres_store::{PostgresPipelineStore, TableNames};

#[derive(Debug, thiserror::Error)]
pub enum PipelineStoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing PIPELINE_DB_URL/SUPABASE_DB_URL/DATABASE_URL")]
    MissingDbUrl,
    #[error("invalid table name: {0}")]
    InvalidTableName(String),
    #[error("pipeline store config error: {0}")]
    Config(String),
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

/// Every mutating method that returns `bool` is a guarded conditional
/// update: `false` means the guard no longer matched and nothing was written.
pub trait RunStore: Send + Sync {
    fn start_run(&self, run: &NewRun, now: DateTime<Utc>) -> Result<PipelineRun, PipelineStoreError>;
    fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, PipelineStoreError>;
    fn heartbeat_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, PipelineStoreError>;
    fn finish_run(
        &self,
        run_id: Uuid,
        state: RunState,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError>;
    /// Merges `patch` into the run's metrics and refreshes its heartbeat.
    /// Applies only while the run is still running.
    fn touch_run(
        &self,
        run_id: Uuid,
        patch: &MetricsPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError>;
    /// Running runs whose heartbeat is older than `cutoff`, oldest first.
    fn list_stalled_runs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, PipelineStoreError>;
}

pub trait EventStore: Send + Sync {
    fn insert_event(
        &self,
        event: &NewMessageEvent,
        now: DateTime<Utc>,
    ) -> Result<MessageEvent, PipelineStoreError>;
    fn get_event(&self, event_id: Uuid) -> Result<Option<MessageEvent>, PipelineStoreError>;
    fn advance_event(
        &self,
        event_id: Uuid,
        transition: EventTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError>;
    fn record_event_error(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError>;
    /// Events in one of `statuses` last updated before `cutoff`, oldest first.
    fn list_stalled_events(
        &self,
        statuses: &[EventStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageEvent>, PipelineStoreError>;
    /// Claims a stalled `received` event for a MATERIALIZE re-submission.
    /// Guarded on `status = received AND updated_at = observed_updated_at`.
    fn mark_event_nudged(
        &self,
        event_id: Uuid,
        observed_updated_at: DateTime<Utc>,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError>;
    fn find_event_for_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<MessageEvent>, PipelineStoreError>;
}

pub trait ConversationStore: Send + Sync {
    fn create_conversation(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConversationCursor, PipelineStoreError>;
    fn get_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<ConversationCursor>, PipelineStoreError>;
    fn record_inbound_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError>;
    fn mark_conversation_classified(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError>;
    /// Conversations whose inbound cursor is ahead of both other cursors.
    fn list_classify_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationCursor>, PipelineStoreError>;
    /// Sets the enqueued cursor to `target` only if it currently differs.
    fn claim_classify(
        &self,
        conversation_id: Uuid,
        target_message_id: Uuid,
    ) -> Result<bool, PipelineStoreError>;
    /// Restores `previous` only if the enqueued cursor still equals `target`.
    fn release_classify_claim(
        &self,
        conversation_id: Uuid,
        target_message_id: Uuid,
        previous: Option<Uuid>,
    ) -> Result<bool, PipelineStoreError>;
}

pub trait IncidentStore: Send + Sync {
    fn count_open_incidents(&self, query: &IncidentQuery<'_>) -> Result<i64, PipelineStoreError>;
    /// Inserts only when no open incident matching the same workspace, scope
    /// and run (if any) was created at or after `since`. The check and the
    /// insert are one atomic step; `None` means an existing incident won.
    fn insert_incident_if_absent(
        &self,
        incident: &NewIncident,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, PipelineStoreError>;
    fn resolve_incident(
        &self,
        incident_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError>;
}

pub trait PipelineStore: RunStore + EventStore + ConversationStore + IncidentStore {}

impl<T> PipelineStore for T where T: RunStore + EventStore + ConversationStore + IncidentStore {}
