use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::store::{IncidentStore, PipelineStoreError};

pub const SCOPE_STALLED_RUN: &str = "pipeline-supervisor:stalled-run";
pub const SCOPE_STALLED_EVENT: &str = "pipeline-supervisor:stalled-event";
pub const SCOPE_CLASSIFY_NUDGE: &str = "pipeline-supervisor:classify-nudge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineIncident {
    pub id: Uuid,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub severity: Severity,
    pub scope: String,
    pub error: String,
    #[serde(default)]
    pub context: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PipelineIncident {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub workspace_id: Uuid,
    pub run_id: Option<Uuid>,
    pub severity: Severity,
    pub scope: String,
    pub error: String,
    pub context: Value,
}

/// Filter for open incidents created at or after `since`.
///
/// When `run_id` is `None` the run column is not part of the match.
#[derive(Debug, Clone, Copy)]
pub struct IncidentQuery<'a> {
    pub workspace_id: Uuid,
    pub scope: &'a str,
    pub run_id: Option<Uuid>,
    pub since: DateTime<Utc>,
}

impl IncidentQuery<'_> {
    pub fn matches(&self, incident: &PipelineIncident) -> bool {
        incident.is_open()
            && incident.workspace_id == self.workspace_id
            && incident.scope == self.scope
            && incident.created_at >= self.since
            && self.run_id.map_or(true, |run_id| incident.run_id == Some(run_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentOutcome {
    Recorded(Uuid),
    Suppressed,
}

impl IncidentOutcome {
    pub fn was_recorded(&self) -> bool {
        matches!(self, IncidentOutcome::Recorded(_))
    }
}

/// Dedup gate in front of an incident store.
pub struct IncidentLedger<'a, S: IncidentStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: IncidentStore + ?Sized> IncidentLedger<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// A failed count is reported as an open incident so a store outage
    /// cannot turn into an alert storm.
    pub fn has_recent_open_incident(
        &self,
        workspace_id: Uuid,
        scope: &str,
        run_id: Option<Uuid>,
        lookback_minutes: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let query = IncidentQuery {
            workspace_id,
            scope,
            run_id,
            since: now - Duration::minutes(lookback_minutes),
        };
        match self.store.count_open_incidents(&query) {
            Ok(count) => count > 0,
            Err(err) => {
                warn!(
                    "incident dedupe check failed for scope={} workspace={}: {}",
                    scope, workspace_id, err
                );
                true
            }
        }
    }

    /// The lookup is a fail-open fast path; the store's conditional insert
    /// decides between concurrent writers sharing a dedupe key.
    pub fn record_incident_once(
        &self,
        incident: &NewIncident,
        dedupe_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<IncidentOutcome, PipelineStoreError> {
        if self.has_recent_open_incident(
            incident.workspace_id,
            &incident.scope,
            incident.run_id,
            dedupe_minutes,
            now,
        ) {
            return Ok(IncidentOutcome::Suppressed);
        }
        let since = now - Duration::minutes(dedupe_minutes);
        match self.store.insert_incident_if_absent(incident, since, now)? {
            Some(id) => Ok(IncidentOutcome::Recorded(id)),
            None => Ok(IncidentOutcome::Suppressed),
        }
    }
}
