use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Keys merged into a run's `metrics` object by `touch_run`.
pub type MetricsPatch = Map<String, Value>;

pub const SUPERVISOR_LAST_CHECKED_AT: &str = "supervisor_last_checked_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(RunState::Running),
            "completed" => Ok(RunState::Completed),
            "failed" => Ok(RunState::Failed),
            other => Err(format!("unknown run state: {}", other)),
        }
    }
}

/// One bounded execution, e.g. importing a workspace's inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub channel: String,
    pub mode: String,
    pub state: RunState,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Only running runs can stall; terminal runs are never flagged.
    pub fn is_stalled(&self, now: DateTime<Utc>, stalled_run_minutes: i64) -> bool {
        self.state == RunState::Running
            && self.last_heartbeat_at < stale_cutoff(now, stalled_run_minutes)
    }

    pub fn heartbeat_age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat_at).num_minutes()
    }
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub workspace_id: Uuid,
    pub channel: String,
    pub mode: String,
    pub params: Map<String, Value>,
}

/// Rows last touched strictly before the returned instant are stale.
pub fn stale_cutoff(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    now - Duration::minutes(minutes)
}

pub fn merge_metrics(metrics: &mut Map<String, Value>, patch: &MetricsPatch) {
    for (key, value) in patch {
        metrics.insert(key.clone(), value.clone());
    }
}

pub fn supervisor_check_patch(now: DateTime<Utc>) -> MetricsPatch {
    let mut patch = MetricsPatch::new();
    patch.insert(
        SUPERVISOR_LAST_CHECKED_AT.to_string(),
        Value::String(now.to_rfc3339()),
    );
    patch
}
