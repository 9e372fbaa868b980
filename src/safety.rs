//! Safety rules on the raw stream, and delivery of the alerts they raise.
//!
//! [`evaluate`] runs inline at ingestion for every accepted reading. The
//! resulting alerts go through a bounded queue to [`run_alert_delivery`], so
//! a slow alert collaborator can only cost deliveries, never evaluations or
//! aggregation progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SafetyThresholds;
use crate::models::{AlertEvent, Reading, SafetyRule};
use crate::stats::PipelineStats;

// ---

/// Every rule the reading violates, one event each.
pub fn evaluate(reading: &Reading, thresholds: &SafetyThresholds) -> Vec<AlertEvent> {
    // ---
    let checks = [
        (
            SafetyRule::IceThicknessBelowMinimum,
            reading.ice_thickness,
            reading.ice_thickness < thresholds.min_ice_thickness_cm,
        ),
        (
            SafetyRule::ExternalTemperatureMeltRisk,
            reading.external_temperature,
            reading.external_temperature > thresholds.melt_risk_external_temp_c,
        ),
        (
            SafetyRule::SurfaceTemperatureMelt,
            reading.surface_temperature,
            reading.surface_temperature > thresholds.max_surface_temp_c,
        ),
    ];

    checks
        .into_iter()
        .filter(|(_, _, violated)| *violated)
        .map(|(rule, value, _)| AlertEvent {
            source_id: reading.source_id.clone(),
            location: reading.location.clone(),
            field: rule.field().to_string(),
            value,
            rule,
            timestamp: reading.timestamp,
        })
        .collect()
}

/// Optional rate limit per (source, location, rule), measured in event time.
#[derive(Debug)]
pub struct AlertSuppressor {
    window: ChronoDuration,
    last: HashMap<(String, String, SafetyRule), DateTime<Utc>>,
}

impl AlertSuppressor {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: i64::try_from(window_secs)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .unwrap_or(ChronoDuration::MAX),
            last: HashMap::new(),
        }
    }

    /// True when the alert should be delivered.
    pub fn admit(&mut self, alert: &AlertEvent) -> bool {
        // ---
        if self.window <= ChronoDuration::zero() {
            return true;
        }
        let key = (alert.source_id.clone(), alert.location.clone(), alert.rule);
        match self.last.get(&key) {
            Some(prev) if alert.timestamp - *prev < self.window && alert.timestamp >= *prev => {
                false
            }
            _ => {
                self.last.insert(key, alert.timestamp);
                true
            }
        }
    }
}

// ---

/// Notification collaborator for alert events.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn deliver(&self, alert: &AlertEvent) -> Result<()>;
}

/// Emits each alert as a structured `warn` log line.
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn deliver(&self, alert: &AlertEvent) -> Result<()> {
        tracing::warn!(
            source_id = %alert.source_id,
            location = %alert.location,
            field = %alert.field,
            value = alert.value,
            rule = ?alert.rule,
            timestamp = %alert.timestamp,
            "unsafe ice condition"
        );
        Ok(())
    }
}

/// POSTs each alert as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("building alert webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn deliver(&self, alert: &AlertEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("posting alert")?
            .error_for_status()
            .context("alert webhook rejected event")?;
        Ok(())
    }
}

/// Keeps alerts in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<AlertEvent>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn deliver(&self, alert: &AlertEvent) -> Result<()> {
        if let Ok(mut guard) = self.alerts.lock() {
            guard.push(alert.clone());
        }
        Ok(())
    }
}

// ---

async fn deliver_one(
    alert: &AlertEvent,
    suppressor: &mut AlertSuppressor,
    sink: &dyn AlertSink,
    stats: &PipelineStats,
) {
    if !suppressor.admit(alert) {
        PipelineStats::incr(&stats.alerts_suppressed);
        return;
    }
    if let Err(err) = sink.deliver(alert).await {
        PipelineStats::incr(&stats.alerts_undelivered);
        tracing::warn!(error = %err, source_id = %alert.source_id, rule = ?alert.rule, "alert delivery failed");
    }
}

/// Deliver queued alerts until shutdown, then drain what is left.
pub async fn run_alert_delivery(
    mut rx: mpsc::Receiver<AlertEvent>,
    sink: Arc<dyn AlertSink>,
    suppress_secs: u64,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
) {
    // ---
    let mut suppressor = AlertSuppressor::new(suppress_secs);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(alert) => deliver_one(&alert, &mut suppressor, sink.as_ref(), &stats).await,
                None => break,
            },
        }
    }

    rx.close();
    while let Some(alert) = rx.recv().await {
        deliver_one(&alert, &mut suppressor, sink.as_ref(), &stats).await;
    }
    tracing::info!("alert delivery stopped");
}
