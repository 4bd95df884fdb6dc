#![allow(dead_code)]

use chrono::{DateTime, Utc};
use pipeline_module::classification::ConversationCursor;
use pipeline_module::message_event::NewMessageEvent;
use pipeline_module::run_tracker::NewRun;
use pipeline_module::store::{ConversationStore, EventStore};
use pipeline_module::{Direction, EventTransition, MessageEvent};
use serde_json::Map;
use uuid::Uuid;

pub fn require_supabase_db_url(test_name: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    match std::env::var("SUPABASE_DB_URL") {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            eprintln!("Skipping {test_name}; SUPABASE_DB_URL not set.");
            None
        }
    }
}

/// Table prefix that keeps concurrent test runs apart.
pub fn unique_table_prefix() -> String {
    format!("t_{}_", &Uuid::new_v4().simple().to_string()[..12])
}

pub fn import_run(workspace_id: Uuid) -> NewRun {
    NewRun {
        workspace_id,
        channel: "email".to_string(),
        mode: "import".to_string(),
        params: Map::new(),
    }
}

pub fn inbound_event(workspace_id: Uuid) -> NewMessageEvent {
    NewMessageEvent {
        workspace_id,
        run_id: None,
        channel: "email".to_string(),
        config_id: None,
        direction: Direction::Inbound,
    }
}

/// Creates a conversation whose latest inbound message is materialized but
/// not classified. Returns the cursor and the originating event.
pub fn seed_unclassified_conversation<S>(
    store: &S,
    workspace_id: Uuid,
    at: DateTime<Utc>,
) -> (ConversationCursor, MessageEvent)
where
    S: ConversationStore + EventStore + ?Sized,
{
    let conversation = store
        .create_conversation(workspace_id, at)
        .expect("create conversation");
    let message_id = Uuid::new_v4();
    let event = store
        .insert_event(&inbound_event(workspace_id), at)
        .expect("insert event");
    assert!(store
        .advance_event(
            event.id,
            EventTransition::Materialized {
                conversation_id: conversation.conversation_id,
                message_id,
            },
            at,
        )
        .expect("materialize event"));
    assert!(store
        .record_inbound_message(conversation.conversation_id, message_id, at)
        .expect("record inbound"));
    let cursor = store
        .get_conversation(conversation.conversation_id)
        .expect("get conversation")
        .expect("conversation exists");
    let event = store
        .get_event(event.id)
        .expect("get event")
        .expect("event exists");
    (cursor, event)
}
