//! Wires producers, the ingestion channel, the aggregator, alert delivery
//! and the sink workers together, and tears them down in order.
//!
//! Shutdown order: producers stop, the aggregator drains and flushes, alert
//! delivery drains, then sink workers get `drain_timeout` to finish queued
//! writes. Anything still unwritten after that is abandoned, counted and
//! moved to the dead-letter list.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{run_aggregator, AggregatorSettings, AggregatorSummary};
use crate::channel::{ingestion_channel, IngestSender, SafetyBranch};
use crate::config::Config;
use crate::error::PipelineError;
use crate::producer::{spawn_producers, ProducerReport};
use crate::safety::{run_alert_delivery, AlertSink};
use crate::sink::{
    dead_letter_queued, spawn_sink_workers, BlobSink, SharedAggregateReceiver, SinkWriter,
};
use crate::stats::{PipelineStats, StatsSnapshot};

/// What an external producer (the HTTP endpoint) needs to push readings.
#[derive(Clone)]
pub struct IngestHandle {
    pub sender: IngestSender,
    pub shutdown: CancellationToken,
    pub stats: Arc<PipelineStats>,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub producers: Vec<ProducerReport>,
    pub aggregator: AggregatorSummary,
    pub writes_abandoned: u64,
    /// The alert delivery task panicked; alerts after that point were lost.
    pub alert_delivery_failed: bool,
    pub stats: StatsSnapshot,
}

pub struct Pipeline {
    config: Config,
    stats: Arc<PipelineStats>,
    sender: IngestSender,
    intake_shutdown: CancellationToken,
    aggregator_shutdown: CancellationToken,
    fatal: CancellationToken,
    producers: Vec<JoinHandle<Option<ProducerReport>>>,
    aggregator: JoinHandle<Result<AggregatorSummary, PipelineError>>,
    alert_delivery: Option<JoinHandle<()>>,
    sink_queue: SharedAggregateReceiver,
    sink_workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Start every task. Producers run only when `simulate_sensors` is set;
    /// readings are checked against the safety rules only when an alert sink
    /// is supplied.
    pub fn start<S: BlobSink>(
        config: Config,
        sink: Arc<S>,
        alerts: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        // ---
        let stats = Arc::new(PipelineStats::new());
        let intake_shutdown = CancellationToken::new();
        let aggregator_shutdown = CancellationToken::new();
        let fatal = CancellationToken::new();

        let (sender, receivers) = ingestion_channel(
            config.channel_capacity,
            alerts.as_ref().map(|_| SafetyBranch {
                thresholds: config.safety.clone(),
                queue_capacity: config.alert_queue_capacity,
            }),
            config.on_backpressure,
            stats.clone(),
        );

        let (agg_tx, agg_rx) = tokio::sync::mpsc::unbounded_channel();
        let writer = Arc::new(SinkWriter::from_config(sink, &config, stats.clone()));
        let sink_queue: SharedAggregateReceiver = Arc::new(tokio::sync::Mutex::new(agg_rx));
        let sink_workers = spawn_sink_workers(config.sink_workers, sink_queue.clone(), writer);

        let aggregator = {
            let stats = stats.clone();
            let settings = AggregatorSettings::from_config(&config);
            let shutdown = aggregator_shutdown.clone();
            // Cancels `fatal` on error and on panic alike.
            let guard = fatal.clone().drop_guard();
            tokio::spawn(async move {
                let result =
                    run_aggregator(receivers.readings, agg_tx, stats, settings, shutdown).await;
                match &result {
                    Ok(_) => {
                        let _ = guard.disarm();
                    }
                    Err(err) => tracing::error!(error = %err, "aggregator failed"),
                }
                result
            })
        };

        let alert_delivery = match (alerts, receivers.alerts) {
            (Some(alert_sink), Some(queue)) => Some(tokio::spawn(run_alert_delivery(
                queue,
                alert_sink,
                config.alert_suppress_secs,
                stats.clone(),
                intake_shutdown.clone(),
            ))),
            _ => None,
        };

        let producers = if config.simulate_sensors {
            spawn_producers(&config.sensors, config.cadence(), &sender, &intake_shutdown)
        } else {
            Vec::new()
        };

        tracing::info!(
            producers = producers.len(),
            sink_workers = sink_workers.len(),
            alerts = alert_delivery.is_some(),
            "pipeline started"
        );

        Self {
            config,
            stats,
            sender,
            intake_shutdown,
            aggregator_shutdown,
            fatal,
            producers,
            aggregator,
            alert_delivery,
            sink_queue,
            sink_workers,
        }
    }

    pub fn ingest_handle(&self) -> IngestHandle {
        IngestHandle {
            sender: self.sender.clone(),
            shutdown: self.intake_shutdown.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Fires if the aggregator fails or panics.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Stop everything in order and report what happened.
    ///
    /// Returns `Err` if the aggregator failed; in-flight writes are still
    /// given their drain window first.
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        // ---
        let Pipeline {
            config,
            stats,
            sender,
            intake_shutdown,
            aggregator_shutdown,
            fatal: _,
            producers,
            aggregator,
            alert_delivery,
            sink_queue,
            mut sink_workers,
        } = self;

        tracing::info!("pipeline shutting down");
        intake_shutdown.cancel();
        let mut producer_reports = Vec::new();
        for handle in producers {
            if let Ok(Some(report)) = handle.await {
                producer_reports.push(report);
            }
        }
        drop(sender);

        aggregator_shutdown.cancel();
        let aggregator = match aggregator.await {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(err)) => Err(anyhow!(err)),
            Err(join) => Err(anyhow!(PipelineError::AggregatorAborted(join.to_string()))),
        };

        let mut alert_delivery_failed = false;
        if let Some(handle) = alert_delivery {
            if let Err(join) = handle.await {
                alert_delivery_failed = true;
                tracing::error!(error = %join, "alert delivery task failed");
            }
        }

        let drained = tokio::time::timeout(config.drain_timeout(), async {
            for handle in sink_workers.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;

        let mut writes_abandoned = 0;
        if drained.is_err() {
            for handle in &sink_workers {
                handle.abort();
            }
            // Aborted workers dead-letter their in-flight record on the way out.
            for handle in sink_workers.iter_mut() {
                let _ = handle.await;
            }
            let queued = dead_letter_queued(&sink_queue, &stats).await;
            writes_abandoned = stats
                .sink_queue_depth
                .load(std::sync::atomic::Ordering::Relaxed);
            PipelineStats::add(&stats.writes_abandoned, writes_abandoned);
            tracing::error!(
                abandoned = writes_abandoned,
                queued,
                timeout_secs = config.drain_timeout_secs,
                "drain timeout reached, remaining aggregate writes moved to dead letters"
            );
        }

        let aggregator = aggregator?;
        let report = ShutdownReport {
            producers: producer_reports,
            aggregator,
            writes_abandoned,
            alert_delivery_failed,
            stats: stats.snapshot(),
        };
        tracing::info!(stats = ?report.stats, "pipeline stopped");
        Ok(report)
    }
}
