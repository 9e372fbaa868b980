// src/routes/health.rs
//! Health endpoint for the ice-condition pipeline.
//!
//! Serves `/health` for container orchestrators and operators. Besides a
//! liveness status it surfaces the pipeline's process-level counters:
//! rejected, late and dropped readings, emitted aggregates, and the
//! ok/retried/failed/abandoned write counts. It follows the Explicit Module
//! Boundary Pattern (EMBP): the handler and its response type stay private
//! here and only the sub-router is exported to the gateway (`mod.rs`).

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::pipeline::IngestHandle;
use crate::stats::StatsSnapshot;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    stats: StatsSnapshot,
}

/// Handle `GET /health`.
///
/// `status` is `ok` while accepting readings, `draining` once shutdown has
/// begun. Counters are a relaxed snapshot and may be mutually a tick apart.
async fn health(State(handle): State<IngestHandle>) -> Json<HealthResponse> {
    let status = if handle.shutdown.is_cancelled() {
        "draining"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        stats: handle.stats.snapshot(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<IngestHandle> {
    Router::new().route("/health", get(health))
}
