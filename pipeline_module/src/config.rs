use std::env;

use serde::Deserialize;

use crate::message_event::{parse_status_list, EventStatus};

pub const DEFAULT_STALLED_RUN_MINUTES: i64 = 6;
pub const DEFAULT_STALLED_EVENT_MINUTES: i64 = 10;
pub const DEFAULT_NUDGE_LIMIT: usize = 25;
pub const DEFAULT_ROW_CONCURRENCY: usize = 8;
pub const DEFAULT_STALLED_RUN_DEDUPE_MINUTES: i64 = 10;
pub const DEFAULT_STALLED_EVENT_DEDUPE_MINUTES: i64 = 15;
pub const DEFAULT_CLASSIFY_DEDUPE_MINUTES: i64 = 30;

/// Detection row caps are this multiple of `nudge_limit`.
pub const SCAN_LIMIT_FACTOR: usize = 3;

/// Knobs for one supervisor sweep. They only change how aggressively stalls
/// are detected and remediated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub stalled_run_minutes: i64,
    pub stalled_event_minutes: i64,
    pub nudge_limit: usize,
    pub row_concurrency: usize,
    pub stalled_run_dedupe_minutes: i64,
    pub stalled_event_dedupe_minutes: i64,
    pub classify_dedupe_minutes: i64,
    pub stalled_event_statuses: Vec<EventStatus>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stalled_run_minutes: DEFAULT_STALLED_RUN_MINUTES,
            stalled_event_minutes: DEFAULT_STALLED_EVENT_MINUTES,
            nudge_limit: DEFAULT_NUDGE_LIMIT,
            row_concurrency: DEFAULT_ROW_CONCURRENCY,
            stalled_run_dedupe_minutes: DEFAULT_STALLED_RUN_DEDUPE_MINUTES,
            stalled_event_dedupe_minutes: DEFAULT_STALLED_EVENT_DEDUPE_MINUTES,
            classify_dedupe_minutes: DEFAULT_CLASSIFY_DEDUPE_MINUTES,
            stalled_event_statuses: EventStatus::ALL.to_vec(),
        }
    }
}

/// `[supervisor]` table of the optional TOML config file.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct SupervisorConfigFile {
    pub stalled_run_minutes: Option<i64>,
    pub stalled_event_minutes: Option<i64>,
    pub nudge_limit: Option<usize>,
    pub row_concurrency: Option<usize>,
    pub stalled_run_dedupe_minutes: Option<i64>,
    pub stalled_event_dedupe_minutes: Option<i64>,
    pub classify_dedupe_minutes: Option<i64>,
    pub stalled_event_statuses: Option<Vec<EventStatus>>,
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self::from_file_and_env(&SupervisorConfigFile::default())
    }

    /// File values override defaults; environment values override both.
    pub fn from_file_and_env(file: &SupervisorConfigFile) -> Self {
        let defaults = Self::default();
        let stalled_event_statuses = env::var("SUPERVISOR_STALLED_EVENT_STATUSES")
            .ok()
            .map(|raw| parse_status_list(&raw))
            .filter(|statuses| !statuses.is_empty())
            .or_else(|| {
                file.stalled_event_statuses
                    .clone()
                    .filter(|statuses| !statuses.is_empty())
            })
            .unwrap_or(defaults.stalled_event_statuses);

        Self {
            stalled_run_minutes: resolve_i64_env(
                "SUPERVISOR_STALLED_RUN_MINUTES",
                positive_i64(file.stalled_run_minutes).unwrap_or(defaults.stalled_run_minutes),
            ),
            stalled_event_minutes: resolve_i64_env(
                "SUPERVISOR_STALLED_EVENT_MINUTES",
                positive_i64(file.stalled_event_minutes).unwrap_or(defaults.stalled_event_minutes),
            ),
            nudge_limit: resolve_usize_env(
                "SUPERVISOR_NUDGE_LIMIT",
                positive_usize(file.nudge_limit).unwrap_or(defaults.nudge_limit),
            ),
            row_concurrency: resolve_usize_env(
                "SUPERVISOR_ROW_CONCURRENCY",
                positive_usize(file.row_concurrency).unwrap_or(defaults.row_concurrency),
            ),
            stalled_run_dedupe_minutes: resolve_i64_env(
                "SUPERVISOR_STALLED_RUN_DEDUPE_MINUTES",
                positive_i64(file.stalled_run_dedupe_minutes)
                    .unwrap_or(defaults.stalled_run_dedupe_minutes),
            ),
            stalled_event_dedupe_minutes: resolve_i64_env(
                "SUPERVISOR_STALLED_EVENT_DEDUPE_MINUTES",
                positive_i64(file.stalled_event_dedupe_minutes)
                    .unwrap_or(defaults.stalled_event_dedupe_minutes),
            ),
            classify_dedupe_minutes: resolve_i64_env(
                "SUPERVISOR_CLASSIFY_DEDUPE_MINUTES",
                positive_i64(file.classify_dedupe_minutes)
                    .unwrap_or(defaults.classify_dedupe_minutes),
            ),
            stalled_event_statuses,
        }
    }

    pub fn scan_limit(&self) -> usize {
        self.nudge_limit.saturating_mul(SCAN_LIMIT_FACTOR)
    }
}

fn positive_i64(value: Option<i64>) -> Option<i64> {
    value.filter(|value| *value > 0)
}

fn positive_usize(value: Option<usize>) -> Option<usize> {
    value.filter(|value| *value > 0)
}

pub(crate) fn resolve_i64_env(key: &str, default_value: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}

pub(crate) fn resolve_i32_env(key: &str, default_value: i32) -> i32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}

pub(crate) fn resolve_usize_env(key: &str, default_value: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}

pub(crate) fn resolve_bool_env(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

pub(crate) fn resolve_string_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
