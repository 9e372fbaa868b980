//! Typed errors at component boundaries. The binary edge uses `anyhow`.

use std::time::Duration;

/// A payload rejected at the ingestion boundary.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid telemetry JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("field `{0}` must be a finite number")]
    NonFinite(&'static str),

    #[error("invalid timestamp {0:?}: {1}")]
    Timestamp(String, #[source] chrono::ParseError),
}

/// Why a push onto the ingestion channel did not go through.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("ingestion channel closed")]
    Closed,

    #[error("shutdown requested while waiting for channel capacity")]
    Cancelled,
}

/// Failure of a single object write.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The target path already holds an object; sinks never overwrite.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("write to {path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },

    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize aggregate: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink backend error: {0}")]
    Backend(String),
}

/// Fatal to a single producer task.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("sensor binding {0:?} has an empty source id or location")]
    InvalidBinding(String),

    #[error("ingestion channel closed under producer {0}")]
    ChannelClosed(String),
}

/// Fatal to the whole pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("aggregate queue closed with {0} record(s) still to hand off")]
    SinkQueueClosed(usize),

    #[error("aggregator task aborted: {0}")]
    AggregatorAborted(String),
}
