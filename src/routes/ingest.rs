use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::channel::PushOutcome;
use crate::error::ChannelError;
use crate::models::TelemetryPayload;
use crate::pipeline::IngestHandle;
use crate::stats::PipelineStats;

// ---

pub fn router() -> Router<IngestHandle> {
    // ---
    Router::new().route("/devices/{device_id}/messages", post(handler))
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn reply(code: StatusCode, status: &'static str, error: Option<String>) -> axum::response::Response {
    (code, Json(IngestResponse { status, error })).into_response()
}

/// Accept one telemetry message from `device_id`.
///
/// The body is parsed and validated here; nothing malformed ever reaches
/// the aggregator.
async fn handler(
    Path(device_id): Path<String>,
    State(handle): State<IngestHandle>,
    body: Bytes,
) -> impl IntoResponse {
    // ---
    let reading = match TelemetryPayload::from_slice(&body).and_then(|p| p.into_reading(&device_id))
    {
        Ok(reading) => reading,
        Err(e) => {
            PipelineStats::incr(&handle.stats.readings_malformed);
            warn!(
                device_id = %device_id,
                error = %e,
                body = %String::from_utf8_lossy(&body[..body.len().min(512)]),
                "rejected malformed telemetry"
            );
            return reply(StatusCode::BAD_REQUEST, "rejected", Some(e.to_string()));
        }
    };

    debug!(device_id = %device_id, location = %reading.location, ts = %reading.timestamp, "telemetry received");

    match handle.sender.push(reading, &handle.shutdown).await {
        Ok(PushOutcome::Enqueued) => reply(StatusCode::ACCEPTED, "accepted", None),
        Ok(PushOutcome::Dropped) => reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "dropped",
            Some("ingestion channel full".into()),
        ),
        Err(ChannelError::Cancelled | ChannelError::Closed) => reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            Some("pipeline is not accepting readings".into()),
        ),
    }
}
