mod test_support;

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use pipeline_module::incident::{IncidentLedger, NewIncident, SCOPE_STALLED_RUN};
use pipeline_module::job_queue::EnqueueOptions;
use pipeline_module::store::{
    ConversationStore, EventStore, IncidentStore, RunStore, TableNames,
};
use pipeline_module::{
    EventStatus, JobQueue, JobType, PipelineJob, PostgresJobQueue, PostgresPipelineStore,
    RunState, Severity, Supervisor, SupervisorConfig,
};
use serde_json::json;
use uuid::Uuid;

use test_support::{
    import_run, inbound_event, require_supabase_db_url, seed_unclassified_conversation,
    unique_table_prefix,
};

/// Postgres keeps microseconds; truncate so guarded timestamp
/// comparisons see the same value that was written.
fn db_now() -> DateTime<Utc> {
    Utc::now()
        .duration_trunc(Duration::microseconds(1))
        .unwrap_or_else(|_| Utc::now())
}

fn open_store(db_url: &str) -> PostgresPipelineStore {
    let tables = TableNames::with_prefix(&unique_table_prefix()).expect("table prefix");
    let store = PostgresPipelineStore::new(db_url, tables).expect("connect store");
    store.ensure_schema().expect("apply schema");
    store
}

#[test]
fn postgres_guarded_updates_match_memory_semantics() {
    let Some(db_url) = require_supabase_db_url("postgres_guarded_updates_match_memory_semantics")
    else {
        return;
    };
    let store = open_store(&db_url);
    let now = db_now();
    let workspace_id = Uuid::new_v4();

    let run = store
        .start_run(&import_run(workspace_id), now - Duration::minutes(7))
        .expect("start run");
    let stalled = store
        .list_stalled_runs(now - Duration::minutes(6), 10)
        .expect("stalled runs");
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, run.id);

    let mut patch = serde_json::Map::new();
    patch.insert("processed".to_string(), json!(12));
    assert!(store.touch_run(run.id, &patch, now).expect("touch"));
    assert!(store
        .finish_run(run.id, RunState::Completed, now)
        .expect("finish"));
    assert!(!store.heartbeat_run(run.id, now).expect("late heartbeat"));
    let finished = store.get_run(run.id).expect("get run").expect("run");
    assert_eq!(finished.state, RunState::Completed);
    assert_eq!(finished.metrics.get("processed"), Some(&json!(12)));

    let event = store
        .insert_event(&inbound_event(workspace_id), now - Duration::minutes(30))
        .expect("insert event");
    let listed = store
        .list_stalled_events(
            &[EventStatus::Received, EventStatus::Materialized],
            now - Duration::minutes(10),
            5,
        )
        .expect("stalled events");
    assert_eq!(listed.len(), 1);
    assert!(store
        .mark_event_nudged(event.id, listed[0].updated_at, "nudged", now)
        .expect("claim"));
    assert!(!store
        .mark_event_nudged(event.id, listed[0].updated_at, "nudged", now)
        .expect("second claim"));

    let (cursor, _) = seed_unclassified_conversation(&store, workspace_id, now);
    let target = cursor.last_inbound_message_id.expect("inbound");
    let candidates = store.list_classify_candidates(10).expect("candidates");
    assert_eq!(candidates.len(), 1);
    assert!(store
        .claim_classify(cursor.conversation_id, target)
        .expect("claim"));
    assert!(!store
        .claim_classify(cursor.conversation_id, target)
        .expect("reclaim"));
    assert!(store
        .release_classify_claim(cursor.conversation_id, target, None)
        .expect("release"));
    assert!(store
        .find_event_for_message(cursor.conversation_id, target)
        .expect("find")
        .is_some());

    let ledger = IncidentLedger::new(&store);
    let incident = NewIncident {
        workspace_id,
        run_id: Some(run.id),
        severity: Severity::Warning,
        scope: SCOPE_STALLED_RUN.to_string(),
        error: "stalled".to_string(),
        context: json!({"run_id": run.id}),
    };
    assert!(ledger
        .record_incident_once(&incident, 10, now)
        .expect("record")
        .was_recorded());
    assert!(!ledger
        .record_incident_once(&incident, 10, now + Duration::minutes(2))
        .expect("record again")
        .was_recorded());
    assert!(ledger.has_recent_open_incident(workspace_id, SCOPE_STALLED_RUN, None, 10, now));

    store.drop_schema().expect("drop schema");
}

#[test]
fn postgres_sweep_enqueues_nudges() {
    let Some(db_url) = require_supabase_db_url("postgres_sweep_enqueues_nudges") else {
        return;
    };
    let store = Arc::new(open_store(&db_url));
    let queue_table = format!("{}pipeline_jobs", unique_table_prefix());
    let queue = Arc::new(PostgresJobQueue::new(&db_url, &queue_table, 60, 5).expect("queue"));
    let now = db_now();
    let event = store
        .insert_event(&inbound_event(Uuid::new_v4()), now - Duration::minutes(20))
        .expect("insert event");

    let supervisor = Supervisor::new(store.clone(), queue.clone(), SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep");
    assert_eq!(summary.stalled_events, 1);
    assert_eq!(summary.nudged_materialize, 1);

    let claimed = queue
        .claim_next(JobType::Materialize)
        .expect("claim")
        .expect("materialize job");
    let PipelineJob::Materialize(job) = &claimed.job else {
        panic!("expected materialize job");
    };
    assert_eq!(job.event_id, event.id);
    assert!(job.supervisor_nudge);
    queue.mark_done(&claimed.id).expect("done");

    let duplicate = queue
        .enqueue(
            &claimed.job,
            &EnqueueOptions::immediate(pipeline_module::supervisor::materialize_idempotency_key(
                event.id,
                event.updated_at,
            )),
        )
        .expect("enqueue duplicate");
    assert!(!duplicate.inserted);

    let incidents = store
        .count_open_incidents(&pipeline_module::incident::IncidentQuery {
            workspace_id: event.workspace_id,
            scope: pipeline_module::incident::SCOPE_STALLED_EVENT,
            run_id: None,
            since: now - Duration::minutes(15),
        })
        .expect("count incidents");
    assert_eq!(incidents, 1);

    queue.drop_table().expect("drop queue");
    store.drop_schema().expect("drop schema");
}
