mod test_support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use pipeline_module::incident::{SCOPE_CLASSIFY_NUDGE, SCOPE_STALLED_EVENT, SCOPE_STALLED_RUN};
use pipeline_module::run_tracker::SUPERVISOR_LAST_CHECKED_AT;
use pipeline_module::store::{ConversationStore, EventStore, RunStore};
use pipeline_module::{
    JobType, MemoryJobQueue, MemoryPipelineStore, RunState, Severity, Supervisor,
    SupervisorConfig,
};
use serde_json::Value;
use uuid::Uuid;

use test_support::{import_run, inbound_event, seed_unclassified_conversation};

fn supervisor(store: &Arc<MemoryPipelineStore>, queue: &Arc<MemoryJobQueue>) -> Supervisor {
    Supervisor::new(store.clone(), queue.clone(), SupervisorConfig::default())
}

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    let store = MemoryPipelineStore::new();
    let (cursor, _event) = seed_unclassified_conversation(&store, Uuid::new_v4(), Utc::now());
    let target = cursor.last_inbound_message_id.expect("inbound message");
    let winners = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                if store
                    .claim_classify(cursor.conversation_id, target)
                    .expect("claim")
                {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_sweeps_enqueue_one_classify_job() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    seed_unclassified_conversation(store.as_ref(), Uuid::new_v4(), now);
    let first = supervisor(&store, &queue);
    let second = supervisor(&store, &queue);

    let (a, b) = std::thread::scope(|scope| {
        let a = scope.spawn(|| first.sweep(now).expect("first sweep"));
        let b = scope.spawn(|| second.sweep(now).expect("second sweep"));
        (
            a.join().expect("first thread"),
            b.join().expect("second thread"),
        )
    });

    assert_eq!(a.nudged_classify + b.nudged_classify, 1);
    assert_eq!(queue.jobs_of_type(JobType::Classify).len(), 1);
}

#[test]
fn events_younger_than_threshold_are_not_nudged() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let workspace_id = Uuid::new_v4();
    store
        .insert_event(
            &inbound_event(workspace_id),
            now - Duration::minutes(10) + Duration::seconds(1),
        )
        .expect("young event");
    store
        .insert_event(&inbound_event(workspace_id), now - Duration::minutes(10))
        .expect("boundary event");

    let summary = supervisor(&store, &queue).sweep(now).expect("sweep");

    assert_eq!(summary.stalled_events, 0);
    assert_eq!(summary.nudged_materialize, 0);
    assert!(queue.jobs().is_empty());
    assert!(store.incidents().is_empty());
}

#[test]
fn repeated_sweeps_produce_one_incident_and_one_nudge() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    store
        .insert_event(&inbound_event(Uuid::new_v4()), now - Duration::minutes(45))
        .expect("stuck event");
    let supervisor = supervisor(&store, &queue);

    for step in 0..5 {
        supervisor
            .sweep(now + Duration::minutes(step))
            .expect("sweep");
    }

    let incidents = store.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].scope, SCOPE_STALLED_EVENT);
    assert_eq!(queue.jobs_of_type(JobType::Materialize).len(), 1);
}

#[test]
fn incident_lookup_failure_suppresses_alerts_but_not_the_sweep() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let run = store
        .start_run(&import_run(Uuid::new_v4()), now - Duration::minutes(20))
        .expect("start run");
    store
        .insert_event(&inbound_event(Uuid::new_v4()), now - Duration::minutes(20))
        .expect("stuck event");
    store.set_incident_lookup_failure(true);

    let summary = supervisor(&store, &queue).sweep(now).expect("sweep");

    assert_eq!(summary.stalled_runs, 1);
    assert_eq!(summary.stalled_events, 1);
    assert_eq!(summary.nudged_materialize, 1);
    assert!(store.incidents().is_empty());
    let touched = store.get_run(run.id).expect("get run").expect("run");
    assert_eq!(touched.last_heartbeat_at, now);
}

#[test]
fn large_backlog_is_bounded_per_sweep() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    for index in 0..1000 {
        store
            .insert_event(
                &inbound_event(Uuid::new_v4()),
                now - Duration::minutes(30) - Duration::seconds(index),
            )
            .expect("stuck event");
        seed_unclassified_conversation(store.as_ref(), Uuid::new_v4(), now);
    }
    let config = SupervisorConfig::default();
    assert_eq!(config.nudge_limit, 25);

    let summary = supervisor(&store, &queue).sweep(now).expect("sweep");

    assert_eq!(summary.stalled_events, config.scan_limit());
    assert_eq!(summary.nudged_materialize, 25);
    assert_eq!(summary.nudged_classify, 25);
    assert_eq!(queue.jobs_of_type(JobType::Materialize).len(), 25);
    assert_eq!(queue.jobs_of_type(JobType::Classify).len(), 25);

    let incidents = store.incidents();
    let stalled_event_incidents = incidents
        .iter()
        .filter(|incident| incident.scope == SCOPE_STALLED_EVENT)
        .count();
    assert_eq!(stalled_event_incidents, config.scan_limit());
    let classify_incidents = incidents
        .iter()
        .filter(|incident| incident.scope == SCOPE_CLASSIFY_NUDGE)
        .count();
    assert_eq!(classify_incidents, 25);
}

#[test]
fn stalled_run_is_reported_once_per_dedupe_window() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let run = store
        .start_run(&import_run(Uuid::new_v4()), now - Duration::minutes(7))
        .expect("start run");
    let supervisor = supervisor(&store, &queue);

    let first = supervisor.sweep(now).expect("first sweep");
    assert_eq!(first.stalled_runs, 1);
    let incidents = store.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].scope, SCOPE_STALLED_RUN);
    assert_eq!(incidents[0].severity, Severity::Warning);
    assert_eq!(incidents[0].run_id, Some(run.id));

    let touched = store.get_run(run.id).expect("get run").expect("run");
    assert_eq!(touched.state, RunState::Running);
    assert_eq!(
        touched.metrics.get(SUPERVISOR_LAST_CHECKED_AT),
        Some(&Value::String(now.to_rfc3339()))
    );

    let second = supervisor
        .sweep(now + Duration::minutes(2))
        .expect("second sweep");
    assert_eq!(second.stalled_runs, 0);
    assert_eq!(store.incidents().len(), 1);
}

#[test]
fn stalled_run_without_touch_is_still_deduplicated() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let workspace_id = Uuid::new_v4();
    let run = store
        .start_run(&import_run(workspace_id), now - Duration::minutes(7))
        .expect("start run");
    let supervisor = supervisor(&store, &queue);
    supervisor.sweep(now).expect("first sweep");

    // A worker heartbeat that lands in the past keeps the run stale.
    assert!(store
        .heartbeat_run(run.id, now - Duration::minutes(9))
        .expect("heartbeat"));
    let second = supervisor
        .sweep(now + Duration::minutes(2))
        .expect("second sweep");

    assert_eq!(second.stalled_runs, 1);
    assert_eq!(store.incidents().len(), 1);
}

#[test]
fn slow_incident_store_still_records_one_incident_per_key() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let workspace_id = Uuid::new_v4();
    for index in 0..75 {
        store
            .insert_event(
                &inbound_event(workspace_id),
                now - Duration::minutes(30) - Duration::seconds(index),
            )
            .expect("stuck event");
    }
    store.set_incident_latency(Some(StdDuration::from_millis(2)));
    let config = SupervisorConfig::default();
    assert!(config.row_concurrency > 1);

    let summary = supervisor(&store, &queue).sweep(now).expect("sweep");

    assert_eq!(summary.stalled_events, 75);
    assert_eq!(summary.nudged_materialize, 25);
    let stalled_event_incidents = store
        .incidents()
        .into_iter()
        .filter(|incident| incident.scope == SCOPE_STALLED_EVENT)
        .count();
    assert_eq!(stalled_event_incidents, 1);
}
