use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::Map;
use uuid::Uuid;

use crate::classification::ConversationCursor;
use crate::incident::{IncidentQuery, NewIncident, PipelineIncident};
use crate::message_event::{EventStatus, EventTransition, MessageEvent, NewMessageEvent};
use crate::run_tracker::{merge_metrics, MetricsPatch, NewRun, PipelineRun, RunState};

use super::{ConversationStore, EventStore, IncidentStore, PipelineStoreError, RunStore};

#[derive(Default)]
struct MemoryState {
    runs: HashMap<Uuid, PipelineRun>,
    events: HashMap<Uuid, MessageEvent>,
    conversations: HashMap<Uuid, ConversationCursor>,
    incidents: Vec<PipelineIncident>,
}

/// Process-local store for the `memory` backend and for tests.
///
/// Each guarded update runs under one lock, which gives it the same
/// compare-and-set behavior as the SQL `WHERE` guards.
#[derive(Default)]
pub struct MemoryPipelineStore {
    state: Mutex<MemoryState>,
    fail_incident_lookups: AtomicBool,
    fail_stalled_event_scans: AtomicBool,
    incident_latency: Mutex<Option<StdDuration>>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, PipelineStoreError> {
        self.state
            .lock()
            .map_err(|_| PipelineStoreError::Config("memory store lock poisoned".to_string()))
    }

    /// Makes `count_open_incidents` fail until switched back off.
    pub fn set_incident_lookup_failure(&self, fail: bool) {
        self.fail_incident_lookups.store(fail, Ordering::SeqCst);
    }

    /// Makes `list_stalled_events` fail until switched back off.
    pub fn set_stalled_event_scan_failure(&self, fail: bool) {
        self.fail_stalled_event_scans.store(fail, Ordering::SeqCst);
    }

    /// Adds a fixed delay before every incident read and write, outside the
    /// lock, the way a remote round trip would.
    pub fn set_incident_latency(&self, latency: Option<StdDuration>) {
        if let Ok(mut slot) = self.incident_latency.lock() {
            *slot = latency;
        }
    }

    fn incident_round_trip(&self) {
        let latency = self.incident_latency.lock().ok().and_then(|slot| *slot);
        if let Some(latency) = latency {
            thread::sleep(latency);
        }
    }

    pub fn runs(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self
            .state
            .lock()
            .map(|state| state.runs.values().cloned().collect())
            .unwrap_or_default();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    pub fn events(&self) -> Vec<MessageEvent> {
        let mut events: Vec<MessageEvent> = self
            .state
            .lock()
            .map(|state| state.events.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|event| event.created_at);
        events
    }

    pub fn incidents(&self) -> Vec<PipelineIncident> {
        self.state
            .lock()
            .map(|state| state.incidents.clone())
            .unwrap_or_default()
    }
}

impl RunStore for MemoryPipelineStore {
    fn start_run(&self, run: &NewRun, now: DateTime<Utc>) -> Result<PipelineRun, PipelineStoreError> {
        let record = PipelineRun {
            id: Uuid::new_v4(),
            workspace_id: run.workspace_id,
            channel: run.channel.clone(),
            mode: run.mode.clone(),
            state: RunState::Running,
            last_heartbeat_at: now,
            params: run.params.clone(),
            metrics: Map::new(),
            created_at: now,
        };
        self.lock()?.runs.insert(record.id, record.clone());
        Ok(record)
    }

    fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, PipelineStoreError> {
        Ok(self.lock()?.runs.get(&run_id).cloned())
    }

    fn heartbeat_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.state == RunState::Running => {
                run.last_heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn finish_run(
        &self,
        run_id: Uuid,
        next: RunState,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        if !next.is_terminal() {
            return Err(PipelineStoreError::InvalidTransition(format!(
                "run {} cannot finish as {}",
                run_id, next
            )));
        }
        let mut state = self.lock()?;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.state == RunState::Running => {
                run.state = next;
                run.last_heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn touch_run(
        &self,
        run_id: Uuid,
        patch: &MetricsPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.state == RunState::Running => {
                merge_metrics(&mut run.metrics, patch);
                run.last_heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_stalled_runs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, PipelineStoreError> {
        let state = self.lock()?;
        let mut runs: Vec<PipelineRun> = state
            .runs
            .values()
            .filter(|run| run.state == RunState::Running && run.last_heartbeat_at < cutoff)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.last_heartbeat_at);
        runs.truncate(limit);
        Ok(runs)
    }
}

impl EventStore for MemoryPipelineStore {
    fn insert_event(
        &self,
        event: &NewMessageEvent,
        now: DateTime<Utc>,
    ) -> Result<MessageEvent, PipelineStoreError> {
        let record = MessageEvent {
            id: Uuid::new_v4(),
            workspace_id: event.workspace_id,
            run_id: event.run_id,
            channel: event.channel.clone(),
            config_id: event.config_id,
            status: EventStatus::Received,
            direction: event.direction,
            materialized_conversation_id: None,
            materialized_message_id: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        self.lock()?.events.insert(record.id, record.clone());
        Ok(record)
    }

    fn get_event(&self, event_id: Uuid) -> Result<Option<MessageEvent>, PipelineStoreError> {
        Ok(self.lock()?.events.get(&event_id).cloned())
    }

    fn advance_event(
        &self,
        event_id: Uuid,
        transition: EventTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        let Some(event) = state.events.get_mut(&event_id) else {
            return Ok(false);
        };
        if !event.status.can_advance_to(transition.target()) {
            return Ok(false);
        }
        if let EventTransition::Materialized {
            conversation_id,
            message_id,
        } = transition
        {
            event.materialized_conversation_id = Some(conversation_id);
            event.materialized_message_id = Some(message_id);
        }
        event.status = transition.target();
        event.updated_at = now;
        event.last_error = None;
        Ok(true)
    }

    fn record_event_error(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state.events.get_mut(&event_id) {
            Some(event) => {
                event.last_error = Some(error.to_string());
                event.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_stalled_events(
        &self,
        statuses: &[EventStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageEvent>, PipelineStoreError> {
        if self.fail_stalled_event_scans.load(Ordering::SeqCst) {
            return Err(PipelineStoreError::Config(
                "stalled event scans disabled".to_string(),
            ));
        }
        let state = self.lock()?;
        let mut events: Vec<MessageEvent> = state
            .events
            .values()
            .filter(|event| statuses.contains(&event.status) && event.updated_at < cutoff)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.updated_at);
        events.truncate(limit);
        Ok(events)
    }

    fn mark_event_nudged(
        &self,
        event_id: Uuid,
        observed_updated_at: DateTime<Utc>,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state.events.get_mut(&event_id) {
            Some(event)
                if event.status == EventStatus::Received
                    && event.updated_at == observed_updated_at =>
            {
                event.updated_at = now;
                event.last_error = Some(note.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn find_event_for_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<MessageEvent>, PipelineStoreError> {
        let state = self.lock()?;
        Ok(state
            .events
            .values()
            .filter(|event| {
                event.materialized_conversation_id == Some(conversation_id)
                    && event.materialized_message_id == Some(message_id)
            })
            .max_by_key(|event| event.updated_at)
            .cloned())
    }
}

impl ConversationStore for MemoryPipelineStore {
    fn create_conversation(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConversationCursor, PipelineStoreError> {
        let cursor = ConversationCursor {
            conversation_id: Uuid::new_v4(),
            workspace_id,
            last_inbound_message_id: None,
            last_classified_message_id: None,
            last_classify_enqueued_message_id: None,
            updated_at: now,
        };
        self.lock()?
            .conversations
            .insert(cursor.conversation_id, cursor.clone());
        Ok(cursor)
    }

    fn get_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<ConversationCursor>, PipelineStoreError> {
        Ok(self.lock()?.conversations.get(&conversation_id).cloned())
    }

    fn record_inbound_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state.conversations.get_mut(&conversation_id) {
            Some(cursor) => {
                cursor.last_inbound_message_id = Some(message_id);
                cursor.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn mark_conversation_classified(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state.conversations.get_mut(&conversation_id) {
            Some(cursor) => {
                cursor.last_classified_message_id = Some(message_id);
                cursor.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_classify_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationCursor>, PipelineStoreError> {
        let state = self.lock()?;
        let mut candidates: Vec<ConversationCursor> = state
            .conversations
            .values()
            .filter(|cursor| cursor.owed_classification().is_ok())
            .cloned()
            .collect();
        candidates.sort_by_key(|cursor| cursor.updated_at);
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn claim_classify(
        &self,
        conversation_id: Uuid,
        target_message_id: Uuid,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state.conversations.get_mut(&conversation_id) {
            Some(cursor) if cursor.last_classify_enqueued_message_id != Some(target_message_id) => {
                cursor.last_classify_enqueued_message_id = Some(target_message_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_classify_claim(
        &self,
        conversation_id: Uuid,
        target_message_id: Uuid,
        previous: Option<Uuid>,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state.conversations.get_mut(&conversation_id) {
            Some(cursor) if cursor.last_classify_enqueued_message_id == Some(target_message_id) => {
                cursor.last_classify_enqueued_message_id = previous;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl IncidentStore for MemoryPipelineStore {
    fn count_open_incidents(&self, query: &IncidentQuery<'_>) -> Result<i64, PipelineStoreError> {
        self.incident_round_trip();
        if self.fail_incident_lookups.load(Ordering::SeqCst) {
            return Err(PipelineStoreError::Config(
                "incident lookups disabled".to_string(),
            ));
        }
        let state = self.lock()?;
        let count = state
            .incidents
            .iter()
            .filter(|incident| query.matches(incident))
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    fn insert_incident_if_absent(
        &self,
        incident: &NewIncident,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, PipelineStoreError> {
        self.incident_round_trip();
        let query = IncidentQuery {
            workspace_id: incident.workspace_id,
            scope: &incident.scope,
            run_id: incident.run_id,
            since,
        };
        let mut state = self.lock()?;
        if state.incidents.iter().any(|existing| query.matches(existing)) {
            return Ok(None);
        }
        let id = Uuid::new_v4();
        state.incidents.push(PipelineIncident {
            id,
            workspace_id: incident.workspace_id,
            run_id: incident.run_id,
            severity: incident.severity,
            scope: incident.scope.clone(),
            error: incident.error.clone(),
            context: incident.context.clone(),
            created_at: now,
            resolved_at: None,
        });
        Ok(Some(id))
    }

    fn resolve_incident(
        &self,
        incident_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineStoreError> {
        let mut state = self.lock()?;
        match state
            .incidents
            .iter_mut()
            .find(|incident| incident.id == incident_id && incident.is_open())
        {
            Some(incident) => {
                incident.resolved_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
