//! Self-hosted ice-condition telemetry pipeline.
//!
//! Simulated sensors and an HTTP ingestion endpoint feed one bounded
//! channel. A single aggregator task buckets readings into tumbling windows
//! per (sensor, location) and hands each closed window to a pool of sink
//! workers, which persist it as one JSON object under a date/hour/location
//! partition. Every accepted reading is also checked against the safety rules, and
//! alerts are delivered from a bounded queue on the side.
//!
//! Module boundaries follow EMBP: each module exports a small surface and
//! `main.rs` only talks to `config`, `pipeline`, `routes` and the sinks.

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod producer;
pub mod routes;
pub mod safety;
pub mod sink;
pub mod stats;
pub mod window;

pub use config::Config;
pub use models::{AggregateRecord, AlertEvent, Reading, TelemetryPayload, WindowKey};
pub use pipeline::{IngestHandle, Pipeline, ShutdownReport};
