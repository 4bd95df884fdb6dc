use chrono::{DateTime, Utc};
use postgres::Row;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::classification::ConversationCursor;
use crate::config::{resolve_bool_env, resolve_string_env};
use crate::incident::{IncidentQuery, NewIncident};
use crate::message_event::{EventStatus, EventTransition, MessageEvent, NewMessageEvent};
use crate::pg::{
    build_pool, drop_pool_off_thread, is_valid_table_name, resolve_db_url, PgConnection, PgPool,
    PoolBuildError,
};
use crate::run_tracker::{MetricsPatch, NewRun, PipelineRun, RunState};

use super::schema::{drop_schema, pipeline_schema};
use super::{ConversationStore, EventStore, IncidentStore, PipelineStoreError, RunStore};

impl From<PoolBuildError> for PipelineStoreError {
    fn from(err: PoolBuildError) -> Self {
        match err {
            PoolBuildError::Postgres(err) => PipelineStoreError::Postgres(err),
            PoolBuildError::Pool(err) => PipelineStoreError::Pool(err),
            PoolBuildError::Tls(detail) => PipelineStoreError::Config(detail),
        }
    }
}

/// Physical table names, optionally sharing a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub runs: String,
    pub events: String,
    pub conversations: String,
    pub incidents: String,
}

impl TableNames {
    pub fn with_prefix(prefix: &str) -> Result<Self, PipelineStoreError> {
        let prefix = prefix.trim();
        if !prefix.is_empty() && (prefix.contains('.') || !is_valid_table_name(prefix)) {
            return Err(PipelineStoreError::InvalidTableName(prefix.to_string()));
        }
        Ok(Self {
            runs: format!("{}pipeline_runs", prefix),
            events: format!("{}message_events", prefix),
            conversations: format!("{}conversations", prefix),
            incidents: format!("{}pipeline_incidents", prefix),
        })
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            runs: "pipeline_runs".to_string(),
            events: "message_events".to_string(),
            conversations: "conversations".to_string(),
            incidents: "pipeline_incidents".to_string(),
        }
    }
}

const RUN_COLUMNS: &str =
    "id, workspace_id, channel, mode, state, last_heartbeat_at, params::text, metrics::text, created_at";
const EVENT_COLUMNS: &str = "id, workspace_id, run_id, channel, config_id, status, direction, \
     materialized_conversation_id, materialized_message_id, created_at, updated_at, last_error";
const CONVERSATION_COLUMNS: &str = "id, workspace_id, last_inbound_message_id, \
     last_classified_message_id, last_classify_enqueued_message_id, updated_at";

pub struct PostgresPipelineStore {
    pool: Option<PgPool>,
    tables: TableNames,
}

impl PostgresPipelineStore {
    pub fn from_env() -> Result<Self, PipelineStoreError> {
        let db_url = resolve_db_url().ok_or(PipelineStoreError::MissingDbUrl)?;
        Self::new_from_url(&db_url)
    }

    pub fn new_from_url(db_url: &str) -> Result<Self, PipelineStoreError> {
        let prefix = resolve_string_env("PIPELINE_TABLE_PREFIX").unwrap_or_default();
        let store = Self::new(db_url, TableNames::with_prefix(&prefix)?)?;
        if resolve_bool_env("PIPELINE_APPLY_SCHEMA") {
            store.ensure_schema()?;
        }
        Ok(store)
    }

    pub fn new(db_url: &str, tables: TableNames) -> Result<Self, PipelineStoreError> {
        let pool = build_pool(db_url, 8, "pipeline_store")?;
        Ok(Self {
            pool: Some(pool),
            tables,
        })
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    fn connection(&self) -> Result<PgConnection, PipelineStoreError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| PipelineStoreError::Config("pipeline store pool dropped".to_string()))?;
        Ok(pool.get()?)
    }

    pub fn ensure_schema(&self) -> Result<(), PipelineStoreError> {
        let mut conn = self.connection()?;
        conn.batch_execute(&pipeline_schema(&self.tables))?;
        Ok(())
    }

    pub fn drop_schema(&self) -> Result<(), PipelineStoreError> {
        let mut conn = self.connection()?;
        conn.batch_execute(&drop_schema(&self.tables))?;
        Ok(())
    }
}

impl Drop for PostgresPipelineStore {
    fn drop(&mut self) {
        drop_pool_off_thread(self.pool.take());
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_json_object(
    table: &'static str,
    raw: Option<String>,
) -> Result<Map<String, Value>, PipelineStoreError> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(PipelineStoreError::CorruptRow {
                table,
                detail: format!("expected JSON object, found {}", other),
            }),
        },
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(
    table: &'static str,
    raw: &str,
) -> Result<T, PipelineStoreError> {
    raw.parse::<T>()
        .map_err(|detail| PipelineStoreError::CorruptRow { table, detail })
}

fn run_from_row(row: &Row) -> Result<PipelineRun, PipelineStoreError> {
    let state: String = row.get(4);
    Ok(PipelineRun {
        id: row.get(0),
        workspace_id: row.get(1),
        channel: row.get(2),
        mode: row.get(3),
        state: parse_column::<RunState>("pipeline_runs", &state)?,
        last_heartbeat_at: row.get(5),
        params: parse_json_object("pipeline_runs", row.get(6))?,
        metrics: parse_json_object("pipeline_runs", row.get(7))?,
        created_at: row.get(8),
    })
}

fn event_from_row(row: &Row) -> Result<MessageEvent, PipelineStoreError> {
    let status: String = row.get(5);
    let direction: String = row.get(6);
    Ok(MessageEvent {
        id: row.get(0),
        workspace_id: row.get(1),
        run_id: row.get(2),
        channel: row.get(3),
        config_id: row.get(4),
        status: parse_column("message_events", &status)?,
        direction: parse_column("message_events", &direction)?,
        materialized_conversation_id: row.get(7),
        materialized_message_id: row.get(8),
        created_at: row.get(9),
        updated_at: row.get(10),
        last_error: row.get(11),
    })
}

fn conversation_from_row(row: &Row) -> ConversationCursor {
    ConversationCursor {
        conversation_id: row.get(0),
        workspace_id: row.get(1),
        last_inbound_message_id: row.get(2),
        last_classified_message_id: row.get(3),
        last_classify_enqueued_message_id: row.get(4),
        updated_at: row.get(5),
    }
}

impl RunStore for PostgresPipelineStore {
    fn start_run(&self, run: &NewRun, now: DateTime<Utc>) -> Result<PipelineRun, PipelineStoreError> {
        let mut conn = self.connection()?;
        let params_json = serde_json::to_string(&run.params)?;
        let row = conn.query_one(
            &format!(
                "INSERT INTO {table}
                    (id, workspace_id, channel, mode, state, last_heartbeat_at, params, metrics, created_at)
                 VALUES ($1, $2, $3, $4, 'running', $5, $6::text::jsonb, '{{}}'::jsonb, $5)
                 RETURNING {columns}",
                table = self.tables.runs,
                columns = RUN_COLUMNS
            ),
            &[
                &Uuid::new_v4(),
                &run.workspace_id,
                &run.channel,
                &run.mode,
                &now,
                &params_json,
            ],
        )?;
        run_from_row(&row)
    }

    fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, PipelineStoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {columns} FROM {table} WHERE id = $1",
                table = self.tables.runs,
                columns = RUN_COLUMNS
            ),
            &[&run_id],
        )?;
        row.as_ref().map(run_from_row).transpose()
    }

    fn heartbeat_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table} SET last_heartbeat_at = $2 WHERE id = $1 AND state = 'running'",
                table = self.tables.runs
            ),
            &[&run_id, &now],
        )?;
        Ok(rows > 0)
    }

    fn finish_run(
        &self,
        run_id: Uuid,
        state: RunState,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        if !state.is_terminal() {
            return Err(PipelineStoreError::InvalidTransition(format!(
                "run {} cannot finish as {}",
                run_id, state
            )));
        }
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table}
                 SET state = $2, last_heartbeat_at = $3
                 WHERE id = $1 AND state = 'running'",
                table = self.tables.runs
            ),
            &[&run_id, &state.as_str(), &now],
        )?;
        Ok(rows > 0)
    }

    fn touch_run(
        &self,
        run_id: Uuid,
        patch: &MetricsPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let patch_json = serde_json::to_string(patch)?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table}
                 SET metrics = COALESCE(metrics, '{{}}'::jsonb) || $2::text::jsonb,
                     last_heartbeat_at = $3
                 WHERE id = $1 AND state = 'running'",
                table = self.tables.runs
            ),
            &[&run_id, &patch_json, &now],
        )?;
        Ok(rows > 0)
    }

    fn list_stalled_runs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {columns}
                 FROM {table}
                 WHERE state = 'running' AND last_heartbeat_at < $1
                 ORDER BY last_heartbeat_at
                 LIMIT $2",
                table = self.tables.runs,
                columns = RUN_COLUMNS
            ),
            &[&cutoff, &limit_param(limit)],
        )?;
        rows.iter().map(run_from_row).collect()
    }
}

impl EventStore for PostgresPipelineStore {
    fn insert_event(
        &self,
        event: &NewMessageEvent,
        now: DateTime<Utc>,
    ) -> Result<MessageEvent, PipelineStoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            &format!(
                "INSERT INTO {table}
                    (id, workspace_id, run_id, channel, config_id, status, direction, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, 'received', $6, $7, $7)
                 RETURNING {columns}",
                table = self.tables.events,
                columns = EVENT_COLUMNS
            ),
            &[
                &Uuid::new_v4(),
                &event.workspace_id,
                &event.run_id,
                &event.channel,
                &event.config_id,
                &event.direction.as_str(),
                &now,
            ],
        )?;
        event_from_row(&row)
    }

    fn get_event(&self, event_id: Uuid) -> Result<Option<MessageEvent>, PipelineStoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {columns} FROM {table} WHERE id = $1",
                table = self.tables.events,
                columns = EVENT_COLUMNS
            ),
            &[&event_id],
        )?;
        row.as_ref().map(event_from_row).transpose()
    }

    fn advance_event(
        &self,
        event_id: Uuid,
        transition: EventTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let expected = transition.expected_status().as_str();
        let target = transition.target().as_str();
        let rows = match transition {
            EventTransition::Materialized {
                conversation_id,
                message_id,
            } => conn.execute(
                &format!(
                    "UPDATE {table}
                     SET status = $3,
                         materialized_conversation_id = $4,
                         materialized_message_id = $5,
                         updated_at = $6,
                         last_error = NULL
                     WHERE id = $1 AND status = $2",
                    table = self.tables.events
                ),
                &[
                    &event_id,
                    &expected,
                    &target,
                    &conversation_id,
                    &message_id,
                    &now,
                ],
            )?,
            EventTransition::Classified => conn.execute(
                &format!(
                    "UPDATE {table}
                     SET status = $3, updated_at = $4, last_error = NULL
                     WHERE id = $1 AND status = $2",
                    table = self.tables.events
                ),
                &[&event_id, &expected, &target, &now],
            )?,
        };
        Ok(rows > 0)
    }

    fn record_event_error(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table} SET last_error = $2, updated_at = $3 WHERE id = $1",
                table = self.tables.events
            ),
            &[&event_id, &error, &now],
        )?;
        Ok(rows > 0)
    }

    fn list_stalled_events(
        &self,
        statuses: &[EventStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageEvent>, PipelineStoreError> {
        let statuses: Vec<String> = statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {columns}
                 FROM {table}
                 WHERE status = ANY($1) AND updated_at < $2
                 ORDER BY updated_at
                 LIMIT $3",
                table = self.tables.events,
                columns = EVENT_COLUMNS
            ),
            &[&statuses, &cutoff, &limit_param(limit)],
        )?;
        rows.iter().map(event_from_row).collect()
    }

    fn mark_event_nudged(
        &self,
        event_id: Uuid,
        observed_updated_at: DateTime<Utc>,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table}
                 SET updated_at = $3, last_error = $4
                 WHERE id = $1 AND status = 'received' AND updated_at = $2",
                table = self.tables.events
            ),
            &[&event_id, &observed_updated_at, &now, &note],
        )?;
        Ok(rows > 0)
    }

    fn find_event_for_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<MessageEvent>, PipelineStoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {columns}
                 FROM {table}
                 WHERE materialized_conversation_id = $1 AND materialized_message_id = $2
                 ORDER BY updated_at DESC
                 LIMIT 1",
                table = self.tables.events,
                columns = EVENT_COLUMNS
            ),
            &[&conversation_id, &message_id],
        )?;
        row.as_ref().map(event_from_row).transpose()
    }
}

impl ConversationStore for PostgresPipelineStore {
    fn create_conversation(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConversationCursor, PipelineStoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            &format!(
                "INSERT INTO {table} (id, workspace_id, updated_at)
                 VALUES ($1, $2, $3)
                 RETURNING {columns}",
                table = self.tables.conversations,
                columns = CONVERSATION_COLUMNS
            ),
            &[&Uuid::new_v4(), &workspace_id, &now],
        )?;
        Ok(conversation_from_row(&row))
    }

    fn get_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<ConversationCursor>, PipelineStoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {columns} FROM {table} WHERE id = $1",
                table = self.tables.conversations,
                columns = CONVERSATION_COLUMNS
            ),
            &[&conversation_id],
        )?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    fn record_inbound_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table} SET last_inbound_message_id = $2, updated_at = $3 WHERE id = $1",
                table = self.tables.conversations
            ),
            &[&conversation_id, &message_id, &now],
        )?;
        Ok(rows > 0)
    }

    fn mark_conversation_classified(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table} SET last_classified_message_id = $2, updated_at = $3 WHERE id = $1",
                table = self.tables.conversations
            ),
            &[&conversation_id, &message_id, &now],
        )?;
        Ok(rows > 0)
    }

    fn list_classify_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationCursor>, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {columns}
                 FROM {table}
                 WHERE last_inbound_message_id IS NOT NULL
                   AND last_inbound_message_id IS DISTINCT FROM last_classified_message_id
                   AND last_inbound_message_id IS DISTINCT FROM last_classify_enqueued_message_id
                 ORDER BY updated_at
                 LIMIT $1",
                table = self.tables.conversations,
                columns = CONVERSATION_COLUMNS
            ),
            &[&limit_param(limit)],
        )?;
        Ok(rows.iter().map(conversation_from_row).collect())
    }

    fn claim_classify(
        &self,
        conversation_id: Uuid,
        target_message_id: Uuid,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table}
                 SET last_classify_enqueued_message_id = $2
                 WHERE id = $1 AND last_classify_enqueued_message_id IS DISTINCT FROM $2",
                table = self.tables.conversations
            ),
            &[&conversation_id, &target_message_id],
        )?;
        Ok(rows > 0)
    }

    fn release_classify_claim(
        &self,
        conversation_id: Uuid,
        target_message_id: Uuid,
        previous: Option<Uuid>,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table}
                 SET last_classify_enqueued_message_id = $3
                 WHERE id = $1 AND last_classify_enqueued_message_id = $2",
                table = self.tables.conversations
            ),
            &[&conversation_id, &target_message_id, &previous],
        )?;
        Ok(rows > 0)
    }
}

impl IncidentStore for PostgresPipelineStore {
    fn count_open_incidents(&self, query: &IncidentQuery<'_>) -> Result<i64, PipelineStoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            &format!(
                "SELECT COUNT(*)
                 FROM {table}
                 WHERE workspace_id = $1
                   AND scope = $2
                   AND resolved_at IS NULL
                   AND created_at >= $3
                   AND ($4::uuid IS NULL OR run_id = $4)",
                table = self.tables.incidents
            ),
            &[&query.workspace_id, &query.scope, &query.since, &query.run_id],
        )?;
        Ok(row.get(0))
    }

    fn insert_incident_if_absent(
        &self,
        incident: &NewIncident,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, PipelineStoreError> {
        let mut conn = self.connection()?;
        let id = Uuid::new_v4();
        let context_json = serde_json::to_string(&incident.context)?;
        // Serializes writers per workspace and scope so the NOT EXISTS check
        // sees every committed insert, including run-less ones.
        let lock_key = format!(
            "{}:{}:{}",
            self.tables.incidents, incident.workspace_id, incident.scope
        );

        let mut tx = conn.transaction()?;
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1::text))", &[&lock_key])?;
        let rows = tx.execute(
            &format!(
                "INSERT INTO {table}
                    (id, workspace_id, run_id, severity, scope, error, context, created_at)
                 SELECT $1::uuid, $2::uuid, $3::uuid, $4::text, $5::text, $6::text,
                        $7::text::jsonb, $8::timestamptz
                 WHERE NOT EXISTS (
                    SELECT 1
                    FROM {table}
                    WHERE workspace_id = $2::uuid
                      AND scope = $5::text
                      AND resolved_at IS NULL
                      AND created_at >= $9::timestamptz
                      AND ($3::uuid IS NULL OR run_id = $3::uuid)
                 )",
                table = self.tables.incidents
            ),
            &[
                &id,
                &incident.workspace_id,
                &incident.run_id,
                &incident.severity.as_str(),
                &incident.scope,
                &incident.error,
                &context_json,
                &now,
                &since,
            ],
        )?;
        tx.commit()?;
        Ok((rows > 0).then_some(id))
    }

    fn resolve_incident(
        &self,
        incident_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut conn = self.connection()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {table} SET resolved_at = $2 WHERE id = $1 AND resolved_at IS NULL",
                table = self.tables.incidents
            ),
            &[&incident_id, &now],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_prefix_is_applied_to_every_table() {
        let tables = TableNames::with_prefix("t_abc_").expect("prefix");
        assert_eq!(tables.runs, "t_abc_pipeline_runs");
        assert_eq!(tables.events, "t_abc_message_events");
        assert_eq!(tables.conversations, "t_abc_conversations");
        assert_eq!(tables.incidents, "t_abc_pipeline_incidents");
        assert_eq!(TableNames::with_prefix("").expect("empty"), TableNames::default());
    }

    #[test]
    fn table_prefix_rejects_schema_and_punctuation() {
        assert!(TableNames::with_prefix("public.").is_err());
        assert!(TableNames::with_prefix("x; drop").is_err());
    }

    #[test]
    fn json_object_columns_reject_non_objects() {
        assert!(parse_json_object("pipeline_runs", None).expect("none").is_empty());
        let parsed =
            parse_json_object("pipeline_runs", Some("{\"a\":1}".to_string())).expect("object");
        assert_eq!(parsed.get("a"), Some(&Value::from(1)));
        assert!(parse_json_object("pipeline_runs", Some("[1]".to_string())).is_err());
    }
}
