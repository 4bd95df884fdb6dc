use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run_tracker::stale_cutoff;

/// Ingestion stage of a single channel message.
///
/// Stages only move forward, one step at a time:
/// `received -> materialized -> classified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Received,
    Materialized,
    Classified,
}

impl EventStatus {
    pub const ALL: [EventStatus; 3] = [
        EventStatus::Received,
        EventStatus::Materialized,
        EventStatus::Classified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Materialized => "materialized",
            EventStatus::Classified => "classified",
        }
    }

    pub fn next(&self) -> Option<EventStatus> {
        match self {
            EventStatus::Received => Some(EventStatus::Materialized),
            EventStatus::Materialized => Some(EventStatus::Classified),
            EventStatus::Classified => None,
        }
    }

    pub fn can_advance_to(&self, target: EventStatus) -> bool {
        self.next() == Some(target)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "received" => Ok(EventStatus::Received),
            "materialized" => Ok(EventStatus::Materialized),
            "classified" => Ok(EventStatus::Classified),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub channel: String,
    #[serde(default)]
    pub config_id: Option<Uuid>,
    pub status: EventStatus,
    pub direction: Direction,
    #[serde(default)]
    pub materialized_conversation_id: Option<Uuid>,
    #[serde(default)]
    pub materialized_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl MessageEvent {
    pub fn is_stalled(&self, now: DateTime<Utc>, stalled_event_minutes: i64) -> bool {
        self.updated_at < stale_cutoff(now, stalled_event_minutes)
    }

    pub fn stalled_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_minutes()
    }
}

#[derive(Debug, Clone)]
pub struct NewMessageEvent {
    pub workspace_id: Uuid,
    pub run_id: Option<Uuid>,
    pub channel: String,
    pub config_id: Option<Uuid>,
    pub direction: Direction,
}

/// A forward move performed by a MATERIALIZE or CLASSIFY worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTransition {
    Materialized {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    Classified,
}

impl EventTransition {
    pub fn target(&self) -> EventStatus {
        match self {
            EventTransition::Materialized { .. } => EventStatus::Materialized,
            EventTransition::Classified => EventStatus::Classified,
        }
    }

    /// Status the row must still hold for the guarded update to apply.
    pub fn expected_status(&self) -> EventStatus {
        match self {
            EventTransition::Materialized { .. } => EventStatus::Received,
            EventTransition::Classified => EventStatus::Materialized,
        }
    }
}

/// Parses a comma separated status list, ignoring blanks and unknown values.
pub fn parse_status_list(raw: &str) -> Vec<EventStatus> {
    let mut statuses = Vec::new();
    for part in raw.split(',') {
        if let Ok(status) = part.parse::<EventStatus>() {
            if !statuses.contains(&status) {
                statuses.push(status);
            }
        }
    }
    statuses
}
