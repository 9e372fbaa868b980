//! Dead-letter listing: aggregates whose writes exhausted their retries,
//! with the path they were meant for, so an operator can replay them.

use axum::{extract::State, routing::get, Json, Router};

use crate::pipeline::IngestHandle;
use crate::stats::FailedWrite;

pub fn router() -> Router<IngestHandle> {
    Router::new().route("/failed-writes", get(handler))
}

async fn handler(State(handle): State<IngestHandle>) -> Json<Vec<FailedWrite>> {
    Json(handle.stats.failed_writes())
}
