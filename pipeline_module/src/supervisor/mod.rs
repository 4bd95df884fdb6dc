//! Periodic sweep that finds stalled pipeline work and nudges it forward.
//!
//! A sweep is stateless: every counter lives in the invocation, and every
//! write it makes is an incident insert behind the dedupe gate or a guarded
//! conditional update. Running two sweeps at once is safe.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::SupervisorConfig;
use crate::job_queue::JobQueue;
use crate::store::{PipelineStore, PipelineStoreError};

mod classify;
mod events;
mod fanout;
mod runs;

#[cfg(test)]
mod tests;

pub use classify::classify_idempotency_key;
pub use events::materialize_idempotency_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    StalledRuns,
    StalledEvents,
    ClassifyNudge,
}

impl SweepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepPhase::StalledRuns => "stalled-runs",
            SweepPhase::StalledEvents => "stalled-events",
            SweepPhase::ClassifyNudge => "classify-nudge",
        }
    }
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{phase} detection query failed: {source}")]
    Detection {
        phase: SweepPhase,
        #[source]
        source: PipelineStoreError,
    },
}

impl SupervisorError {
    fn detection(phase: SweepPhase) -> impl FnOnce(PipelineStoreError) -> Self {
        move |source| SupervisorError::Detection { phase, source }
    }

    pub fn phase(&self) -> SweepPhase {
        match self {
            SupervisorError::Detection { phase, .. } => *phase,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub stalled_runs: usize,
    pub stalled_events: usize,
    pub nudged_materialize: usize,
    pub nudged_classify: usize,
}

pub struct Supervisor {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn JobQueue>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Runs the three phases in order. A failed detection query aborts the
    /// phases after it; writes already made are kept.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary, SupervisorError> {
        let stalled_runs = runs::sweep_stalled_runs(self, now)?;
        let events = events::sweep_stalled_events(self, now)?;
        let nudged_classify = classify::nudge_classifications(self, now)?;

        let summary = SweepSummary {
            stalled_runs,
            stalled_events: events.stalled,
            nudged_materialize: events.nudged,
            nudged_classify,
        };
        info!(
            "pipeline supervisor sweep: stalled_runs={} stalled_events={} nudged_materialize={} nudged_classify={}",
            summary.stalled_runs,
            summary.stalled_events,
            summary.nudged_materialize,
            summary.nudged_classify
        );
        Ok(summary)
    }
}
