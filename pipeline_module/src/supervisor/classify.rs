use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classification::ConversationCursor;
use crate::incident::{IncidentLedger, NewIncident, Severity, SCOPE_CLASSIFY_NUDGE};
use crate::job_queue::{ClassifyJob, EnqueueOptions, PipelineJob};
use crate::message_event::{Direction, MessageEvent};

use super::fanout::{for_each_row, NudgeBudget};
use super::{Supervisor, SupervisorError, SweepPhase};

pub fn classify_idempotency_key(conversation_id: Uuid, target_message_id: Uuid) -> String {
    format!("supervisor:classify:{}:{}", conversation_id, target_message_id)
}

pub(super) fn nudge_classifications(
    supervisor: &Supervisor,
    now: DateTime<Utc>,
) -> Result<usize, SupervisorError> {
    let config = &supervisor.config;
    let candidates = supervisor
        .store
        .list_classify_candidates(config.scan_limit())
        .map_err(SupervisorError::detection(SweepPhase::ClassifyNudge))?;

    let budget = NudgeBudget::new(config.nudge_limit);
    for_each_row(candidates, config.row_concurrency, |cursor| {
        nudge_conversation(supervisor, &cursor, &budget, now)
    });
    Ok(budget.used())
}

fn nudge_conversation(
    supervisor: &Supervisor,
    cursor: &ConversationCursor,
    budget: &NudgeBudget,
    now: DateTime<Utc>,
) {
    let target = match cursor.owed_classification() {
        Ok(target) => target,
        Err(skip) => {
            debug!(
                "conversation {} owes no classification: {:?}",
                cursor.conversation_id, skip
            );
            return;
        }
    };
    let event = match supervisor
        .store
        .find_event_for_message(cursor.conversation_id, target)
    {
        Ok(Some(event)) => event,
        Ok(None) => {
            debug!(
                "no message event for conversation {} message {}",
                cursor.conversation_id, target
            );
            return;
        }
        Err(err) => {
            warn!(
                "failed to load message event for conversation {}: {}",
                cursor.conversation_id, err
            );
            return;
        }
    };
    if event.direction != Direction::Inbound {
        return;
    }
    if !budget.try_reserve() {
        return;
    }
    if !claim_and_enqueue(supervisor, cursor, target, &event, now) {
        budget.release();
    }
}

/// Returns true when this sweep won the claim and the job is queued.
fn claim_and_enqueue(
    supervisor: &Supervisor,
    cursor: &ConversationCursor,
    target: Uuid,
    event: &MessageEvent,
    now: DateTime<Utc>,
) -> bool {
    let conversation_id = cursor.conversation_id;
    match supervisor.store.claim_classify(conversation_id, target) {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                "classify claim for conversation {} already taken",
                conversation_id
            );
            return false;
        }
        Err(err) => {
            warn!(
                "failed to claim classification for conversation {}: {}",
                conversation_id, err
            );
            return false;
        }
    }

    let job = PipelineJob::Classify(ClassifyJob {
        workspace_id: event.workspace_id,
        run_id: event.run_id,
        config_id: event.config_id,
        channel: event.channel.clone(),
        event_id: event.id,
        conversation_id,
        target_message_id: target,
        supervisor_nudge: true,
    });
    let options = EnqueueOptions::immediate(classify_idempotency_key(conversation_id, target));
    if let Err(err) = supervisor.queue.enqueue(&job, &options) {
        warn!(
            "failed to enqueue classify nudge for conversation {}: {}",
            conversation_id, err
        );
        release_claim(supervisor, cursor, target);
        return false;
    }

    let incident = NewIncident {
        workspace_id: event.workspace_id,
        run_id: None,
        severity: Severity::Info,
        scope: SCOPE_CLASSIFY_NUDGE.to_string(),
        error: "classification was behind the latest inbound message; re-enqueued".to_string(),
        context: json!({
            "conversation_id": conversation_id,
            "target_message_id": target,
            "event_id": event.id,
            "last_classified_message_id": cursor.last_classified_message_id,
        }),
    };
    let ledger = IncidentLedger::new(supervisor.store.as_ref());
    if let Err(err) =
        ledger.record_incident_once(&incident, supervisor.config.classify_dedupe_minutes, now)
    {
        warn!(
            "failed to record classify-nudge incident for conversation {}: {}",
            conversation_id, err
        );
    }
    true
}

fn release_claim(supervisor: &Supervisor, cursor: &ConversationCursor, target: Uuid) {
    let previous = cursor.last_classify_enqueued_message_id;
    match supervisor
        .store
        .release_classify_claim(cursor.conversation_id, target, previous)
    {
        Ok(true) => {}
        Ok(false) => debug!(
            "classify claim for conversation {} moved on before release",
            cursor.conversation_id
        ),
        Err(err) => warn!(
            "failed to release classify claim for conversation {}: {}",
            cursor.conversation_id, err
        ),
    }
}
