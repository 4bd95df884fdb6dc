use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Map;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::incident::{SCOPE_CLASSIFY_NUDGE, SCOPE_STALLED_EVENT, SCOPE_STALLED_RUN};
use crate::job_queue::{
    EnqueueOptions, EnqueueResult, JobQueue, JobQueueError, JobType, PipelineJob, QueuedJob,
};
use crate::memory_queue::MemoryJobQueue;
use crate::message_event::{Direction, EventStatus, EventTransition, NewMessageEvent};
use crate::run_tracker::{NewRun, RunState, SUPERVISOR_LAST_CHECKED_AT};
use crate::store::{
    ConversationStore, EventStore, MemoryPipelineStore, RunStore,
};

use super::{
    classify_idempotency_key, materialize_idempotency_key, Supervisor, SweepPhase, SweepSummary,
};

struct UnavailableQueue;

impl JobQueue for UnavailableQueue {
    fn enqueue(
        &self,
        _job: &PipelineJob,
        _options: &EnqueueOptions,
    ) -> Result<EnqueueResult, JobQueueError> {
        Err(JobQueueError::Unavailable("queue offline".to_string()))
    }

    fn claim_next(&self, _job_type: JobType) -> Result<Option<QueuedJob>, JobQueueError> {
        Ok(None)
    }

    fn mark_done(&self, _id: &Uuid) -> Result<(), JobQueueError> {
        Ok(())
    }

    fn mark_failed(&self, _id: &Uuid, _error: &str) -> Result<(), JobQueueError> {
        Ok(())
    }
}

fn supervisor_with(
    store: &Arc<MemoryPipelineStore>,
    queue: Arc<dyn JobQueue>,
    config: SupervisorConfig,
) -> Supervisor {
    Supervisor::new(store.clone(), queue, config)
}

fn received_event(
    store: &MemoryPipelineStore,
    workspace_id: Uuid,
    at: DateTime<Utc>,
) -> crate::message_event::MessageEvent {
    store
        .insert_event(
            &NewMessageEvent {
                workspace_id,
                run_id: None,
                channel: "email".to_string(),
                config_id: None,
                direction: Direction::Inbound,
            },
            at,
        )
        .expect("insert event")
}

/// A conversation whose newest inbound message is materialized but not
/// yet classified.
fn unclassified_conversation(
    store: &MemoryPipelineStore,
    direction: Direction,
    at: DateTime<Utc>,
) -> (Uuid, Uuid) {
    let workspace_id = Uuid::new_v4();
    let conversation = store
        .create_conversation(workspace_id, at)
        .expect("conversation");
    let message_id = Uuid::new_v4();
    let event = store
        .insert_event(
            &NewMessageEvent {
                workspace_id,
                run_id: None,
                channel: "email".to_string(),
                config_id: None,
                direction,
            },
            at,
        )
        .expect("event");
    assert!(store
        .advance_event(
            event.id,
            EventTransition::Materialized {
                conversation_id: conversation.conversation_id,
                message_id,
            },
            at,
        )
        .expect("materialize"));
    assert!(store
        .record_inbound_message(conversation.conversation_id, message_id, at)
        .expect("inbound"));
    (conversation.conversation_id, message_id)
}

#[test]
fn stalled_run_is_reported_and_touched() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let run = store
        .start_run(
            &NewRun {
                workspace_id: Uuid::new_v4(),
                channel: "email".to_string(),
                mode: "import".to_string(),
                params: Map::new(),
            },
            now - Duration::minutes(7),
        )
        .expect("start run");

    let supervisor = supervisor_with(&store, queue, SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep");

    assert_eq!(summary.stalled_runs, 1);
    let incidents = store.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].scope, SCOPE_STALLED_RUN);
    assert_eq!(incidents[0].run_id, Some(run.id));

    let touched = store.get_run(run.id).expect("get").expect("run");
    assert_eq!(touched.state, RunState::Running);
    assert_eq!(touched.last_heartbeat_at, now);
    assert_eq!(
        touched.metrics.get(SUPERVISOR_LAST_CHECKED_AT),
        Some(&serde_json::Value::String(now.to_rfc3339()))
    );
}

#[test]
fn fresh_work_is_left_alone() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    received_event(&store, Uuid::new_v4(), now - Duration::minutes(9));

    let supervisor = supervisor_with(&store, queue.clone(), SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep");

    assert_eq!(summary, SweepSummary::default());
    assert!(store.incidents().is_empty());
    assert!(queue.jobs().is_empty());
}

#[test]
fn materialize_nudge_carries_the_claimed_timestamp_key() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let event = received_event(&store, Uuid::new_v4(), now - Duration::minutes(30));

    let supervisor = supervisor_with(&store, queue.clone(), SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep");

    assert_eq!(summary.stalled_events, 1);
    assert_eq!(summary.nudged_materialize, 1);
    let jobs = queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(
        jobs[0].idempotency_key,
        materialize_idempotency_key(event.id, event.updated_at)
    );
    let PipelineJob::Materialize(job) = &jobs[0].job else {
        panic!("expected a materialize job");
    };
    assert!(job.supervisor_nudge);
    assert_eq!(job.nudged_at, Some(now));

    let claimed = store.get_event(event.id).expect("get").expect("event");
    assert_eq!(claimed.status, EventStatus::Received);
    assert_eq!(claimed.updated_at, now);
    assert!(claimed.last_error.is_some());
}

#[test]
fn repeated_sweeps_inside_dedupe_window_do_not_storm() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let start = Utc::now();
    received_event(&store, Uuid::new_v4(), start - Duration::minutes(30));
    let supervisor = supervisor_with(&store, queue.clone(), SupervisorConfig::default());

    for step in 0..8 {
        supervisor
            .sweep(start + Duration::minutes(step * 2))
            .expect("sweep");
    }

    let stalled_event_incidents = store
        .incidents()
        .into_iter()
        .filter(|incident| incident.scope == SCOPE_STALLED_EVENT)
        .count();
    assert_eq!(stalled_event_incidents, 1);
    // Nudged at the start and again once the claim itself went stale.
    assert_eq!(queue.jobs_of_type(JobType::Materialize).len(), 2);
}

#[test]
fn materialized_events_are_reported_but_not_resubmitted() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let event = received_event(&store, Uuid::new_v4(), now - Duration::minutes(40));
    store
        .advance_event(
            event.id,
            EventTransition::Materialized {
                conversation_id: Uuid::new_v4(),
                message_id: Uuid::new_v4(),
            },
            now - Duration::minutes(30),
        )
        .expect("advance");

    let supervisor = supervisor_with(&store, queue.clone(), SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep");

    assert_eq!(summary.stalled_events, 1);
    assert_eq!(summary.nudged_materialize, 0);
    assert!(queue.jobs_of_type(JobType::Materialize).is_empty());
}

#[test]
fn queue_outage_leaves_budget_unspent() {
    let store = Arc::new(MemoryPipelineStore::new());
    let now = Utc::now();
    for _ in 0..3 {
        received_event(&store, Uuid::new_v4(), now - Duration::minutes(30));
    }

    let supervisor = supervisor_with(&store, Arc::new(UnavailableQueue), SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep survives queue outage");

    assert_eq!(summary.stalled_events, 3);
    assert_eq!(summary.nudged_materialize, 0);
    assert_eq!(store.incidents().len(), 3);
}

#[test]
fn classify_nudge_enqueues_and_records_info_incident() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let (conversation_id, message_id) =
        unclassified_conversation(&store, Direction::Inbound, now - Duration::minutes(1));

    let supervisor = supervisor_with(&store, queue.clone(), SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep");

    assert_eq!(summary.nudged_classify, 1);
    let jobs = queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(
        jobs[0].idempotency_key,
        classify_idempotency_key(conversation_id, message_id)
    );
    let PipelineJob::Classify(job) = &jobs[0].job else {
        panic!("expected a classify job");
    };
    assert_eq!(job.target_message_id, message_id);
    assert!(job.supervisor_nudge);

    let cursor = store
        .get_conversation(conversation_id)
        .expect("get")
        .expect("cursor");
    assert_eq!(cursor.last_classify_enqueued_message_id, Some(message_id));
    let incidents = store.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].scope, SCOPE_CLASSIFY_NUDGE);

    let again = supervisor.sweep(now + Duration::minutes(1)).expect("sweep");
    assert_eq!(again.nudged_classify, 0);
    assert_eq!(queue.jobs().len(), 1);
}

#[test]
fn outbound_messages_are_not_classified() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    unclassified_conversation(&store, Direction::Outbound, now);

    let supervisor = supervisor_with(&store, queue.clone(), SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep");

    assert_eq!(summary.nudged_classify, 0);
    assert!(queue.jobs().is_empty());
}

#[test]
fn failed_classify_enqueue_releases_the_claim() {
    let store = Arc::new(MemoryPipelineStore::new());
    let now = Utc::now();
    let (conversation_id, _message_id) =
        unclassified_conversation(&store, Direction::Inbound, now);

    let offline = supervisor_with(&store, Arc::new(UnavailableQueue), SupervisorConfig::default());
    assert_eq!(offline.sweep(now).expect("sweep").nudged_classify, 0);
    let cursor = store
        .get_conversation(conversation_id)
        .expect("get")
        .expect("cursor");
    assert_eq!(cursor.last_classify_enqueued_message_id, None);

    let queue = Arc::new(MemoryJobQueue::new());
    let online = supervisor_with(&store, queue.clone(), SupervisorConfig::default());
    assert_eq!(online.sweep(now).expect("sweep").nudged_classify, 1);
    assert_eq!(queue.jobs_of_type(JobType::Classify).len(), 1);
}

#[test]
fn finished_runs_are_never_flagged() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let run = store
        .start_run(
            &NewRun {
                workspace_id: Uuid::new_v4(),
                channel: "email".to_string(),
                mode: "sync".to_string(),
                params: Map::new(),
            },
            now - Duration::hours(2),
        )
        .expect("start");
    store
        .finish_run(run.id, RunState::Failed, now - Duration::hours(1))
        .expect("finish");

    let supervisor = supervisor_with(&store, queue, SupervisorConfig::default());
    assert_eq!(supervisor.sweep(now).expect("sweep").stalled_runs, 0);
    assert!(store.incidents().is_empty());
}

#[test]
fn classified_events_that_stop_moving_are_reported() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let event = received_event(&store, Uuid::new_v4(), now - Duration::minutes(50));
    assert!(store
        .advance_event(
            event.id,
            EventTransition::Materialized {
                conversation_id: Uuid::new_v4(),
                message_id: Uuid::new_v4(),
            },
            now - Duration::minutes(40),
        )
        .expect("materialize"));
    assert!(store
        .advance_event(event.id, EventTransition::Classified, now - Duration::minutes(30))
        .expect("classify"));

    let supervisor = supervisor_with(&store, queue.clone(), SupervisorConfig::default());
    let summary = supervisor.sweep(now).expect("sweep");

    assert_eq!(summary.stalled_events, 1);
    assert_eq!(summary.nudged_materialize, 0);
    let incidents = store.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].scope, SCOPE_STALLED_EVENT);
    assert!(queue.jobs().is_empty());
}

#[test]
fn failed_event_scan_aborts_later_phases_and_keeps_earlier_writes() {
    let store = Arc::new(MemoryPipelineStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let now = Utc::now();
    let run = store
        .start_run(
            &NewRun {
                workspace_id: Uuid::new_v4(),
                channel: "email".to_string(),
                mode: "import".to_string(),
                params: Map::new(),
            },
            now - Duration::minutes(20),
        )
        .expect("start run");
    received_event(&store, Uuid::new_v4(), now - Duration::minutes(30));
    unclassified_conversation(&store, Direction::Inbound, now);
    store.set_stalled_event_scan_failure(true);

    let supervisor = supervisor_with(&store, queue.clone(), SupervisorConfig::default());
    let err = supervisor.sweep(now).expect_err("event scan fails");

    assert_eq!(err.phase(), SweepPhase::StalledEvents);
    assert!(err.to_string().contains("stalled-events"));
    let incidents = store.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].scope, SCOPE_STALLED_RUN);
    let touched = store.get_run(run.id).expect("get").expect("run");
    assert_eq!(touched.last_heartbeat_at, now);
    assert!(touched.metrics.contains_key(SUPERVISOR_LAST_CHECKED_AT));
    assert!(queue.jobs().is_empty());
}
