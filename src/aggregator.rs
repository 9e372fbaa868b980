//! The single consumer of the ingestion channel.
//!
//! This task is the only owner of window state. It wakes for a reading, for
//! the watermark ticker, or for shutdown, and hands every closed window to
//! the sink queue. The ticker only moves the watermark after a full tick with
//! no readings; while traffic flows, event time alone drives it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{AggregateRecord, Reading};
use crate::stats::PipelineStats;
use crate::window::{Admission, WindowAggregator};

pub type AggregateSender = mpsc::UnboundedSender<AggregateRecord>;
pub type AggregateReceiver = mpsc::UnboundedReceiver<AggregateRecord>;

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub window_length: chrono::Duration,
    pub grace: chrono::Duration,
    pub tick: Duration,
    /// Advance the watermark from the wall clock on ticks with no traffic.
    pub idle_advance: bool,
}

impl AggregatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_length: config.window_length(),
            grace: config.grace(),
            tick: config.watermark_tick(),
            idle_advance: config.idle_watermark_advance,
        }
    }
}

/// Totals reported when the aggregator stops cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorSummary {
    pub readings: u64,
    pub late: u64,
    pub emitted: u64,
    /// Records produced by the final shutdown flush.
    pub flushed_on_shutdown: u64,
}

struct Aggregator {
    windows: WindowAggregator,
    out: AggregateSender,
    stats: Arc<PipelineStats>,
    summary: AggregatorSummary,
    /// A reading arrived since the last tick.
    saw_traffic: bool,
}

impl Aggregator {
    fn on_reading(&mut self, reading: Reading) -> Result<(), PipelineError> {
        // ---
        self.summary.readings += 1;
        self.saw_traffic = true;
        let outcome = self.windows.ingest(&reading);
        if let Admission::Late { key, watermark } = &outcome.admission {
            self.summary.late += 1;
            PipelineStats::incr(&self.stats.readings_late);
            tracing::warn!(
                source_id = %key.source_id,
                location = %key.location,
                window_start = %key.window_start,
                reading_ts = %reading.timestamp,
                %watermark,
                "late reading rejected, window already closed"
            );
        }
        self.emit(outcome.closed)
    }

    fn on_tick(&mut self) -> Result<(), PipelineError> {
        if std::mem::take(&mut self.saw_traffic) {
            return Ok(());
        }
        let closed = self.windows.advance_to_wall_clock(Utc::now());
        if !closed.is_empty() {
            tracing::debug!(closed = closed.len(), "watermark tick closed idle windows");
        }
        self.emit(closed)
    }

    fn emit(&mut self, records: Vec<AggregateRecord>) -> Result<(), PipelineError> {
        // ---
        let total = records.len();
        for (i, record) in records.into_iter().enumerate() {
            tracing::debug!(
                source_id = %record.source_id,
                location = %record.location,
                window_start = %record.event_time,
                count = record.reading_count,
                "window closed"
            );
            PipelineStats::incr(&self.stats.sink_queue_depth);
            if self.out.send(record).is_err() {
                PipelineStats::decr(&self.stats.sink_queue_depth);
                return Err(PipelineError::SinkQueueClosed(total - i));
            }
            PipelineStats::incr(&self.stats.aggregates_emitted);
            self.summary.emitted += 1;
        }
        PipelineStats::set(
            &self.stats.open_windows,
            self.windows.open_accumulators() as u64,
        );
        Ok(())
    }
}

/// Drive window state until shutdown or until every sender is gone, then
/// flush whatever is still open exactly once.
///
/// Returning `Err` means aggregates may have been lost; callers must treat
/// it as fatal.
pub async fn run_aggregator(
    mut rx: mpsc::Receiver<Reading>,
    out: AggregateSender,
    stats: Arc<PipelineStats>,
    settings: AggregatorSettings,
    shutdown: CancellationToken,
) -> Result<AggregatorSummary, PipelineError> {
    // ---
    let mut agg = Aggregator {
        windows: WindowAggregator::new(settings.window_length, settings.grace),
        out,
        stats,
        summary: AggregatorSummary::default(),
        saw_traffic: false,
    };
    // First tick one period out, not immediately.
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + settings.tick, settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        window_secs = settings.window_length.num_seconds(),
        grace_secs = settings.grace.num_seconds(),
        "aggregator started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("aggregator draining after shutdown signal");
                break;
            }
            _ = ticker.tick(), if settings.idle_advance => {
                agg.on_tick()?;
            }
            next = rx.recv() => match next {
                Some(reading) => agg.on_reading(reading)?,
                None => {
                    tracing::info!("ingestion channel closed");
                    break;
                }
            },
        }
    }

    // Take whatever producers managed to enqueue before the close.
    rx.close();
    while let Some(reading) = rx.recv().await {
        agg.on_reading(reading)?;
    }

    let flushed = agg.windows.flush_all();
    agg.summary.flushed_on_shutdown = flushed.len() as u64;
    agg.emit(flushed)?;

    tracing::info!(
        readings = agg.summary.readings,
        late = agg.summary.late,
        emitted = agg.summary.emitted,
        flushed = agg.summary.flushed_on_shutdown,
        "aggregator stopped"
    );
    Ok(agg.summary)
}
