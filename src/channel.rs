//! Ingestion channel: bounded fan-in from every producer (simulated sensors
//! and the HTTP endpoint) to the single aggregator task.
//!
//! Every accepted reading is checked against the safety rules right here,
//! so no violation goes unevaluated. Only delivery is queued: a full alert
//! queue never slows a producer or the aggregator, the alert is counted as
//! `alerts_dropped` instead.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::config::{BackpressurePolicy, SafetyThresholds};
use crate::error::ChannelError;
use crate::models::{AlertEvent, Reading};
use crate::safety;
use crate::stats::PipelineStats;

/// Result of a push that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Channel was full under [`BackpressurePolicy::Drop`].
    Dropped,
}

/// Safety rules plus the bounded queue their alerts are delivered through.
#[derive(Debug, Clone)]
pub struct SafetyBranch {
    pub thresholds: SafetyThresholds,
    pub queue_capacity: usize,
}

#[derive(Clone)]
struct AlertTap {
    thresholds: Arc<SafetyThresholds>,
    tx: mpsc::Sender<AlertEvent>,
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<Reading>,
    alerts: Option<AlertTap>,
    policy: BackpressurePolicy,
    stats: Arc<PipelineStats>,
}

/// Receiving halves handed to the aggregator and the alert deliverer.
pub struct IngestReceivers {
    pub readings: mpsc::Receiver<Reading>,
    pub alerts: Option<mpsc::Receiver<AlertEvent>>,
}

/// Build the channel. A `safety` of `None` disables alerting.
pub fn ingestion_channel(
    capacity: usize,
    safety: Option<SafetyBranch>,
    policy: BackpressurePolicy,
    stats: Arc<PipelineStats>,
) -> (IngestSender, IngestReceivers) {
    // ---
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (alerts, alerts_rx) = match safety {
        Some(branch) => {
            let (alert_tx, alert_rx) = mpsc::channel(branch.queue_capacity.max(1));
            let tap = AlertTap {
                thresholds: Arc::new(branch.thresholds),
                tx: alert_tx,
            };
            (Some(tap), Some(alert_rx))
        }
        None => (None, None),
    };

    let sender = IngestSender {
        tx,
        alerts,
        policy,
        stats,
    };
    let receivers = IngestReceivers {
        readings: rx,
        alerts: alerts_rx,
    };
    (sender, receivers)
}

impl IngestSender {
    // ---
    /// Push one reading according to the configured backpressure policy.
    ///
    /// Under `Block` this waits for capacity, but returns
    /// [`ChannelError::Cancelled`] as soon as `shutdown` fires so a producer
    /// stuck on a full channel still observes shutdown.
    pub async fn push(
        &self,
        reading: Reading,
        shutdown: &CancellationToken,
    ) -> Result<PushOutcome, ChannelError> {
        // ---
        if shutdown.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }

        let violations = self
            .alerts
            .as_ref()
            .map(|tap| safety::evaluate(&reading, &tap.thresholds))
            .unwrap_or_default();

        match self.policy {
            BackpressurePolicy::Block => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(ChannelError::Cancelled),
                    sent = self.tx.send(reading) => {
                        sent.map_err(|_| ChannelError::Closed)?;
                    }
                }
            }
            BackpressurePolicy::Drop => match self.tx.try_send(reading) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    PipelineStats::incr(&self.stats.readings_dropped);
                    tracing::debug!(
                        source_id = %dropped.source_id,
                        location = %dropped.location,
                        "ingestion channel full, reading dropped"
                    );
                    return Ok(PushOutcome::Dropped);
                }
                Err(TrySendError::Closed(_)) => return Err(ChannelError::Closed),
            },
        }

        PipelineStats::incr(&self.stats.readings_accepted);
        if let Some(tap) = self.alerts.as_ref() {
            for alert in violations {
                PipelineStats::incr(&self.stats.alerts_raised);
                if let Err(err) = tap.tx.try_send(alert) {
                    PipelineStats::incr(&self.stats.alerts_dropped);
                    let alert = match err {
                        TrySendError::Full(a) | TrySendError::Closed(a) => a,
                    };
                    tracing::warn!(
                        source_id = %alert.source_id,
                        rule = ?alert.rule,
                        "alert queue full, delivery dropped"
                    );
                }
            }
        }
        Ok(PushOutcome::Enqueued)
    }
}
