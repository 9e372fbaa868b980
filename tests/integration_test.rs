use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use icewatch::config::{Config, SensorBinding};
use icewatch::routes;
use icewatch::safety::MemoryAlertSink;
use icewatch::sink::MemorySink;
use icewatch::Pipeline;

#[derive(Debug, Deserialize)]
struct Health {
    status: String,
    stats: Stats,
}

#[derive(Debug, Deserialize)]
struct Stats {
    readings_accepted: u64,
    readings_malformed: u64,
    alerts_raised: u64,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct StoredAggregate {
    DeviceId: String,
    location: String,
    AvgIceThickness: f64,
    AvgSnowAccumulation: f64,
    EventTime: DateTime<Utc>,
}

struct Harness {
    base: String,
    pipeline: Pipeline,
    sink: Arc<MemorySink>,
    alerts: Arc<MemoryAlertSink>,
    stop: CancellationToken,
    server: JoinHandle<()>,
}

async fn start(config: Config) -> Result<Harness> {
    // ---
    let sink = Arc::new(MemorySink::new());
    let alerts = Arc::new(MemoryAlertSink::new());
    let pipeline = Pipeline::start(config, sink.clone(), Some(alerts.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let app = routes::router(pipeline.ingest_handle());
    let stop = CancellationToken::new();
    let server = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
        })
    };

    Ok(Harness {
        base,
        pipeline,
        sink,
        alerts,
        stop,
        server,
    })
}

fn http_only() -> Config {
    Config {
        simulate_sensors: false,
        idle_watermark_advance: false,
        ..Config::default()
    }
}

fn telemetry(ice: f64, ts: &str) -> serde_json::Value {
    json!({
        "surfaceTemperature": -6.0,
        "externalTemperature": -14.0,
        "iceThickness": ice,
        "snowAccumulation": 3.0,
        "location": "NAC",
        "timestamp": ts,
        "humidity": 70.0
    })
}

#[tokio::test]
async fn ingest_aggregate_and_persist() -> Result<()> {
    // ---
    let h = start(http_only()).await?;
    let client = Client::new();
    let url = format!("{}/devices/sensor2/messages", h.base);

    for (ice, ts) in [
        (26.0, "2025-01-15T18:45:00Z"),
        (27.5, "2025-01-15T18:45:10Z"),
        (29.0, "2025-01-15T18:45:20Z"),
    ] {
        let resp = client.post(&url).json(&telemetry(ice, ts)).send().await?;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    // next window closes the first one
    let resp = client
        .post(&url)
        .json(&telemetry(40.0, "2025-01-15T18:50:00Z"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    // malformed: missing iceThickness
    let resp = client
        .post(&url)
        .json(&json!({"location": "NAC", "timestamp": "2025-01-15T18:45:00Z"}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // malformed: not JSON at all
    let resp = client.post(&url).body("hello").send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let health: Health = client
        .get(format!("{}/health", h.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health.status, "ok");
    assert_eq!(health.stats.readings_accepted, 4);
    assert_eq!(health.stats.readings_malformed, 2);

    h.stop.cancel();
    h.server.await?;
    let report = h.pipeline.shutdown().await?;
    assert_eq!(report.stats.aggregates_emitted, 2);
    assert_eq!(report.stats.writes_succeeded, 2);
    assert_eq!(report.aggregator.flushed_on_shutdown, 1);

    let paths = h.sink.paths();
    assert_eq!(
        paths,
        vec![
            "output/2025/01/15/18/NAC/sensor2_20250115T184500Z.json".to_string(),
            "output/2025/01/15/18/NAC/sensor2_20250115T185000Z.json".to_string(),
        ]
    );

    let stored: Vec<StoredAggregate> = h
        .sink
        .records()
        .into_iter()
        .map(|r| serde_json::from_value(serde_json::to_value(r).unwrap()).unwrap())
        .collect();
    let first = &stored[0];
    assert_eq!(first.DeviceId, "sensor2");
    assert_eq!(first.location, "NAC");
    assert_eq!(first.AvgIceThickness, 27.5);
    assert_eq!(first.AvgSnowAccumulation, 3.0);
    assert_eq!(first.EventTime.to_rfc3339(), "2025-01-15T18:45:00+00:00");

    // 26.0, 27.5 and 29.0 are under the 30 cm minimum
    assert_eq!(h.alerts.alerts().len(), 3);
    Ok(())
}

#[tokio::test]
async fn late_reading_is_counted_not_aggregated() -> Result<()> {
    // ---
    let h = start(http_only()).await?;
    let client = Client::new();
    let url = format!("{}/devices/sensor1/messages", h.base);

    for (ice, ts) in [
        (35.0, "2025-01-15T10:00:05Z"),
        (35.0, "2025-01-15T10:05:05Z"),
        // window 10:00 already closed
        (1.0, "2025-01-15T10:04:59Z"),
    ] {
        let resp = client.post(&url).json(&telemetry(ice, ts)).send().await?;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    h.stop.cancel();
    h.server.await?;
    let report = h.pipeline.shutdown().await?;
    assert_eq!(report.stats.readings_late, 1);
    assert_eq!(report.aggregator.late, 1);

    let records = h.sink.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.avg_ice_thickness == 35.0));
    Ok(())
}

#[tokio::test]
async fn health_reports_draining_and_intake_refused_after_shutdown() -> Result<()> {
    // ---
    let h = start(http_only()).await?;
    let client = Client::new();
    let handle = h.pipeline.ingest_handle();
    handle.shutdown.cancel();

    let health: Health = client
        .get(format!("{}/health", h.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health.status, "draining");
    assert_eq!(health.stats.alerts_raised, 0);

    let resp = client
        .post(format!("{}/devices/sensor1/messages", h.base))
        .json(&telemetry(35.0, "2025-01-15T10:00:05Z"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    h.stop.cancel();
    h.server.await?;
    h.pipeline.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn simulated_sensors_produce_one_record_per_window_and_key() -> Result<()> {
    // ---
    let config = Config {
        simulate_sensors: true,
        cadence_secs: 1,
        window_length_secs: 2,
        // event-time watermark only, with a second of slack between sensors
        grace_secs: 1,
        idle_watermark_advance: false,
        sensors: vec![
            SensorBinding::new("sensor1", "Dow's Lake"),
            SensorBinding::new("sensor2", "NAC"),
        ],
        ..Config::default()
    };
    let h = start(config).await?;
    tokio::time::sleep(Duration::from_millis(4_500)).await;

    h.stop.cancel();
    h.server.await?;
    let report = h.pipeline.shutdown().await?;

    let records = h.sink.records();
    assert!(!records.is_empty());
    assert_eq!(report.stats.writes_succeeded as usize, records.len());

    // every accepted reading lands in exactly one aggregate
    let counted: u64 = report.producers.iter().map(|p| p.emitted).sum();
    assert_eq!(report.aggregator.readings, counted);
    assert_eq!(report.stats.readings_late, 0);

    let mut keys: Vec<_> = records
        .iter()
        .map(|r| (r.source_id.clone(), r.location.clone(), r.event_time))
        .collect();
    let before = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), before, "an aggregate was emitted twice");
    Ok(())
}
