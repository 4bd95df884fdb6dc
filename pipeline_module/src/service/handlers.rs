use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::task;
use tracing::{error, warn};

use crate::supervisor::Supervisor;

use super::auth::verify_worker_credential;
use super::state::SupervisorState;

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub(super) async fn run_supervisor_sweep(
    State(state): State<SupervisorState>,
    method: Method,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if method != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({"ok": false, "error": "method_not_allowed"})),
        );
    }
    if let Err(reason) = verify_worker_credential(&headers, state.worker_token.as_deref()) {
        warn!("pipeline supervisor rejected trigger: {}", reason);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "error": "unauthorized"})),
        );
    }

    let started = Instant::now();
    let supervisor = state.supervisor.clone();
    match task::spawn_blocking(move || sweep_report(&supervisor, started)).await {
        Ok((status, body)) => (status, Json(body)),
        Err(err) => {
            error!("pipeline supervisor sweep task failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "ok": false,
                    "error": err.to_string(),
                    "elapsed_ms": elapsed_ms(started),
                })),
            )
        }
    }
}

/// Runs one sweep and renders the trigger's response body. `elapsed_ms`
/// is measured from `started`.
pub fn sweep_report(supervisor: &Supervisor, started: Instant) -> (StatusCode, Value) {
    match supervisor.sweep(Utc::now()) {
        Ok(summary) => (
            StatusCode::OK,
            json!({
                "ok": true,
                "stalled_runs": summary.stalled_runs,
                "stalled_events": summary.stalled_events,
                "nudged_materialize": summary.nudged_materialize,
                "nudged_classify": summary.nudged_classify,
                "elapsed_ms": elapsed_ms(started),
            }),
        ),
        Err(err) => {
            error!("pipeline supervisor sweep failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "ok": false,
                    "error": err.to_string(),
                    "elapsed_ms": elapsed_ms(started),
                }),
            )
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
