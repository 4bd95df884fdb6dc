use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::incident::{
    IncidentLedger, IncidentOutcome, NewIncident, Severity, SCOPE_STALLED_EVENT,
};
use crate::job_queue::{EnqueueOptions, MaterializeJob, PipelineJob};
use crate::message_event::{EventStatus, MessageEvent};
use crate::run_tracker::stale_cutoff;

use super::fanout::{for_each_row, NudgeBudget};
use super::{Supervisor, SupervisorError, SweepPhase};

pub(super) struct EventSweep {
    pub(super) stalled: usize,
    pub(super) nudged: usize,
}

/// Keyed on the timestamp the nudge claim observed, so a later stall of the
/// same event gets a fresh job.
pub fn materialize_idempotency_key(event_id: Uuid, observed_updated_at: DateTime<Utc>) -> String {
    format!(
        "supervisor:materialize:{}:{}",
        event_id,
        observed_updated_at.timestamp_micros()
    )
}

pub(super) fn sweep_stalled_events(
    supervisor: &Supervisor,
    now: DateTime<Utc>,
) -> Result<EventSweep, SupervisorError> {
    let config = &supervisor.config;
    let cutoff = stale_cutoff(now, config.stalled_event_minutes);
    let events = supervisor
        .store
        .list_stalled_events(&config.stalled_event_statuses, cutoff, config.scan_limit())
        .map_err(SupervisorError::detection(SweepPhase::StalledEvents))?;
    let stalled = events.len();

    let budget = NudgeBudget::new(config.nudge_limit);
    for_each_row(events, config.row_concurrency, |event| {
        check_stalled_event(supervisor, &event, &budget, now)
    });
    Ok(EventSweep {
        stalled,
        nudged: budget.used(),
    })
}

fn check_stalled_event(
    supervisor: &Supervisor,
    event: &MessageEvent,
    budget: &NudgeBudget,
    now: DateTime<Utc>,
) {
    let stalled_minutes = event.stalled_minutes(now);
    let incident = NewIncident {
        workspace_id: event.workspace_id,
        run_id: event.run_id,
        severity: Severity::Warning,
        scope: SCOPE_STALLED_EVENT.to_string(),
        error: format!(
            "message event stuck in {} for {} minutes",
            event.status, stalled_minutes
        ),
        context: json!({
            "event_id": event.id,
            "status": event.status,
            "channel": event.channel,
            "updated_at": event.updated_at.to_rfc3339(),
            "stalled_minutes": stalled_minutes,
            "last_error": event.last_error,
        }),
    };
    let ledger = IncidentLedger::new(supervisor.store.as_ref());
    match ledger.record_incident_once(
        &incident,
        supervisor.config.stalled_event_dedupe_minutes,
        now,
    ) {
        Ok(IncidentOutcome::Recorded(id)) => {
            debug!("recorded stalled-event incident {} for event {}", id, event.id)
        }
        Ok(IncidentOutcome::Suppressed) => {}
        Err(err) => warn!(
            "failed to record stalled-event incident for event {}: {}",
            event.id, err
        ),
    }

    if event.status != EventStatus::Received {
        return;
    }
    if !budget.try_reserve() {
        debug!("materialize nudge budget spent; event {} waits for the next sweep", event.id);
        return;
    }
    if !nudge_materialize(supervisor, event, now) {
        budget.release();
    }
}

/// Claims the event, then re-submits MATERIALIZE. Returns true when a job
/// was enqueued.
fn nudge_materialize(supervisor: &Supervisor, event: &MessageEvent, now: DateTime<Utc>) -> bool {
    let note = format!(
        "supervisor re-enqueued MATERIALIZE after {} minutes in received",
        event.stalled_minutes(now)
    );
    match supervisor
        .store
        .mark_event_nudged(event.id, event.updated_at, &note, now)
    {
        Ok(true) => {}
        Ok(false) => {
            debug!("event {} changed before the nudge claim; skipping", event.id);
            return false;
        }
        Err(err) => {
            warn!("failed to claim stalled event {} for nudge: {}", event.id, err);
            return false;
        }
    }

    let job = PipelineJob::Materialize(MaterializeJob {
        event_id: event.id,
        workspace_id: event.workspace_id,
        run_id: event.run_id,
        channel: event.channel.clone(),
        config_id: event.config_id,
        supervisor_nudge: true,
        nudged_at: Some(now),
    });
    let options = EnqueueOptions::immediate(materialize_idempotency_key(event.id, event.updated_at));
    match supervisor.queue.enqueue(&job, &options) {
        Ok(result) if result.inserted => true,
        Ok(_) => {
            debug!("materialize job for event {} already queued", event.id);
            false
        }
        Err(err) => {
            warn!("failed to enqueue materialize nudge for event {}: {}", event.id, err);
            false
        }
    }
}
