//! Simulated ice-condition sensors.
//!
//! One task per bound sensor. Each tick draws every numeric field uniformly
//! from its plausible range, stamps the reading with the current UTC second
//! and pushes it onto the ingestion channel.

use std::ops::Range;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::channel::{IngestSender, PushOutcome};
use crate::config::SensorBinding;
use crate::error::{ChannelError, ProducerError};
use crate::models::Reading;

pub const SURFACE_TEMPERATURE_C: Range<f64> = -20.0..0.0;
pub const EXTERNAL_TEMPERATURE_C: Range<f64> = -25.0..0.0;
pub const ICE_THICKNESS_CM: Range<f64> = 10.0..50.0;
pub const SNOW_ACCUMULATION_CM: Range<f64> = 0.0..15.0;

/// Draw one reading for `binding` at `now`.
pub fn simulate_reading<R: Rng + ?Sized>(
    binding: &SensorBinding,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Reading {
    // ---
    Reading {
        source_id: binding.source_id.clone(),
        location: binding.location.clone(),
        surface_temperature: rng.gen_range(SURFACE_TEMPERATURE_C),
        external_temperature: rng.gen_range(EXTERNAL_TEMPERATURE_C),
        ice_thickness: rng.gen_range(ICE_THICKNESS_CM),
        snow_accumulation: rng.gen_range(SNOW_ACCUMULATION_CM),
        humidity: None,
        timestamp: now.trunc_subsecs(0),
    }
}

/// Readings one producer emitted and dropped before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub emitted: u64,
    pub dropped: u64,
}

/// Emit a reading every `cadence` until `shutdown` fires.
///
/// The reading is fully built before the push, so cancellation can only
/// ever discard a whole reading, never enqueue a partial one.
pub async fn run_producer(
    binding: SensorBinding,
    cadence: Duration,
    sender: IngestSender,
    shutdown: CancellationToken,
) -> Result<ProducerReport, ProducerError> {
    // ---
    if binding.source_id.trim().is_empty() || binding.location.trim().is_empty() {
        return Err(ProducerError::InvalidBinding(format!(
            "{}={}",
            binding.source_id, binding.location
        )));
    }

    let mut report = ProducerReport::default();
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        source_id = %binding.source_id,
        location = %binding.location,
        cadence_secs = cadence.as_secs(),
        "producer started"
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let reading = simulate_reading(&binding, Utc::now(), &mut rand::thread_rng());
        match sender.push(reading, &shutdown).await {
            Ok(PushOutcome::Enqueued) => report.emitted += 1,
            Ok(PushOutcome::Dropped) => report.dropped += 1,
            Err(ChannelError::Cancelled) => break,
            Err(ChannelError::Closed) => {
                return Err(ProducerError::ChannelClosed(binding.source_id));
            }
        }
    }

    tracing::info!(
        source_id = %binding.source_id,
        emitted = report.emitted,
        dropped = report.dropped,
        "producer stopped"
    );
    Ok(report)
}

/// Spawn one producer per binding. A failing producer logs and ends on its
/// own; the others keep running.
pub fn spawn_producers(
    bindings: &[SensorBinding],
    cadence: Duration,
    sender: &IngestSender,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<Option<ProducerReport>>> {
    // ---
    bindings
        .iter()
        .cloned()
        .map(|binding| {
            let sender = sender.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let source_id = binding.source_id.clone();
                match run_producer(binding, cadence, sender, shutdown).await {
                    Ok(report) => Some(report),
                    Err(err) => {
                        tracing::error!(%source_id, error = %err, "producer exited");
                        None
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::channel::ingestion_channel;
    use crate::config::BackpressurePolicy;
    use crate::stats::PipelineStats;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    #[test]
    fn test_simulated_values_stay_in_range() {
        // ---
        let binding = SensorBinding::new("sensor1", "Dow's Lake");
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();
        for _ in 0..1_000 {
            let r = simulate_reading(&binding, now, &mut rng);
            assert!(SURFACE_TEMPERATURE_C.contains(&r.surface_temperature));
            assert!(EXTERNAL_TEMPERATURE_C.contains(&r.external_temperature));
            assert!(ICE_THICKNESS_CM.contains(&r.ice_thickness));
            assert!(SNOW_ACCUMULATION_CM.contains(&r.snow_accumulation));
            assert_eq!(r.location, "Dow's Lake");
            assert_eq!(r.timestamp.timestamp_subsec_nanos(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_thirty_readings_per_five_minute_window() {
        // ---
        let stats = Arc::new(PipelineStats::new());
        let (tx, mut rx) = ingestion_channel(64, None, BackpressurePolicy::Block, stats);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_producer(
            SensorBinding::new("sensor2", "NAC"),
            Duration::from_secs(10),
            tx,
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(295)).await;
        shutdown.cancel();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.emitted, 30);
        let mut received = 0;
        while rx.readings.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_producer_stops_on_shutdown() {
        // ---
        let stats = Arc::new(PipelineStats::new());
        let (tx, _rx) = ingestion_channel(1, None, BackpressurePolicy::Block, stats);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_producer(
            SensorBinding::new("sensor2", "NAC"),
            Duration::from_secs(10),
            tx,
            shutdown.clone(),
        ));
        // first reading fills the channel, the second blocks
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!handle.is_finished());

        shutdown.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.emitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_policy_keeps_ticking() {
        // ---
        let stats = Arc::new(PipelineStats::new());
        let (tx, _rx) = ingestion_channel(1, None, BackpressurePolicy::Drop, stats.clone());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_producer(
            SensorBinding::new("sensor2", "NAC"),
            Duration::from_secs(10),
            tx,
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(45)).await;
        shutdown.cancel();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.emitted, 1);
        assert_eq!(report.dropped, 4);
        assert_eq!(stats.snapshot().readings_dropped, 4);
    }

    #[tokio::test]
    async fn test_invalid_binding_fails_only_that_producer() {
        // ---
        let stats = Arc::new(PipelineStats::new());
        let (tx, _rx) = ingestion_channel(8, None, BackpressurePolicy::Block, stats);
        let shutdown = CancellationToken::new();

        let handles = spawn_producers(
            &[SensorBinding::new("", "NAC"), SensorBinding::new("sensor3", "Fifth Avenue")],
            Duration::from_secs(10),
            &tx,
            &shutdown,
        );
        let mut handles = handles.into_iter();
        assert_eq!(handles.next().unwrap().await.unwrap(), None);

        let healthy = handles.next().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!healthy.is_finished());
        shutdown.cancel();
        assert!(healthy.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closed_channel_ends_producer_with_error() {
        // ---
        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = ingestion_channel(8, None, BackpressurePolicy::Block, stats);
        drop(rx);

        let result = run_producer(
            SensorBinding::new("sensor1", "NAC"),
            Duration::from_secs(10),
            tx,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ProducerError::ChannelClosed(id)) if id == "sensor1"));
    }
}
