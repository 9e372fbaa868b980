//! Route gateway: merges each endpoint's sub-router and binds shared state.
//! `main.rs` only ever calls [`router`].
use axum::Router;

use crate::pipeline::IngestHandle;

mod failed_writes;
mod health;
mod ingest;

// ---

pub fn router(handle: IngestHandle) -> Router {
    // ---
    Router::new()
        .merge(ingest::router())
        .merge(failed_writes::router())
        .merge(health::router())
        .with_state(handle)
}
