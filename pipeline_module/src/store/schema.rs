use super::postgres_store::TableNames;

/// DDL for the tables the supervisor reads and writes. The hosted store
/// normally owns these; `PIPELINE_APPLY_SCHEMA` creates them for local runs
/// and tests.
pub(super) fn pipeline_schema(tables: &TableNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {runs} (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            channel TEXT NOT NULL,
            mode TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'running',
            last_heartbeat_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            params JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            metrics JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX IF NOT EXISTS {runs}_heartbeat_idx
            ON {runs}(state, last_heartbeat_at);

        CREATE TABLE IF NOT EXISTS {events} (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            run_id UUID,
            channel TEXT NOT NULL,
            config_id UUID,
            status TEXT NOT NULL DEFAULT 'received',
            direction TEXT NOT NULL DEFAULT 'inbound',
            materialized_conversation_id UUID,
            materialized_message_id UUID,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_error TEXT
        );
        CREATE INDEX IF NOT EXISTS {events}_stalled_idx
            ON {events}(status, updated_at);
        CREATE INDEX IF NOT EXISTS {events}_message_idx
            ON {events}(materialized_conversation_id, materialized_message_id);

        CREATE TABLE IF NOT EXISTS {conversations} (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            last_inbound_message_id UUID,
            last_classified_message_id UUID,
            last_classify_enqueued_message_id UUID,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );

        CREATE TABLE IF NOT EXISTS {incidents} (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            run_id UUID,
            severity TEXT NOT NULL,
            scope TEXT NOT NULL,
            error TEXT NOT NULL,
            context JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            resolved_at TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS {incidents}_open_idx
            ON {incidents}(workspace_id, scope, created_at)
            WHERE resolved_at IS NULL;",
        runs = tables.runs,
        events = tables.events,
        conversations = tables.conversations,
        incidents = tables.incidents,
    )
}

pub(super) fn drop_schema(tables: &TableNames) -> String {
    format!(
        "DROP TABLE IF EXISTS {incidents};
         DROP TABLE IF EXISTS {conversations};
         DROP TABLE IF EXISTS {events};
         DROP TABLE IF EXISTS {runs};",
        runs = tables.runs,
        events = tables.events,
        conversations = tables.conversations,
        incidents = tables.incidents,
    )
}
