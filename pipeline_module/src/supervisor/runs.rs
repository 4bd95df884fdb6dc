use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::incident::{IncidentLedger, IncidentOutcome, NewIncident, Severity, SCOPE_STALLED_RUN};
use crate::run_tracker::{stale_cutoff, supervisor_check_patch, PipelineRun};

use super::fanout::for_each_row;
use super::{Supervisor, SupervisorError, SweepPhase};

pub(super) fn sweep_stalled_runs(
    supervisor: &Supervisor,
    now: DateTime<Utc>,
) -> Result<usize, SupervisorError> {
    let config = &supervisor.config;
    let cutoff = stale_cutoff(now, config.stalled_run_minutes);
    let runs = supervisor
        .store
        .list_stalled_runs(cutoff, config.scan_limit())
        .map_err(SupervisorError::detection(SweepPhase::StalledRuns))?;
    let stalled = runs.len();

    for_each_row(runs, config.row_concurrency, |run| {
        check_stalled_run(supervisor, &run, now)
    });
    Ok(stalled)
}

fn check_stalled_run(supervisor: &Supervisor, run: &PipelineRun, now: DateTime<Utc>) {
    let age_minutes = run.heartbeat_age_minutes(now);
    let incident = NewIncident {
        workspace_id: run.workspace_id,
        run_id: Some(run.id),
        severity: Severity::Warning,
        scope: SCOPE_STALLED_RUN.to_string(),
        error: format!(
            "pipeline run has not sent a heartbeat for {} minutes",
            age_minutes
        ),
        context: json!({
            "run_id": run.id,
            "channel": run.channel,
            "mode": run.mode,
            "last_heartbeat_at": run.last_heartbeat_at.to_rfc3339(),
            "heartbeat_age_minutes": age_minutes,
            "stalled_run_minutes": supervisor.config.stalled_run_minutes,
        }),
    };
    let ledger = IncidentLedger::new(supervisor.store.as_ref());
    match ledger.record_incident_once(&incident, supervisor.config.stalled_run_dedupe_minutes, now) {
        Ok(IncidentOutcome::Recorded(id)) => {
            debug!("recorded stalled-run incident {} for run {}", id, run.id)
        }
        Ok(IncidentOutcome::Suppressed) => {
            debug!("stalled-run incident for run {} already open", run.id)
        }
        Err(err) => warn!("failed to record stalled-run incident for run {}: {}", run.id, err),
    }

    match supervisor
        .store
        .touch_run(run.id, &supervisor_check_patch(now), now)
    {
        Ok(true) => {}
        Ok(false) => debug!("run {} left running state before supervisor touch", run.id),
        Err(err) => warn!("failed to touch stalled run {}: {}", run.id, err),
    }
}
