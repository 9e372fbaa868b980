//! Configuration loader for the `icewatch-sensorflow` pipeline.
//!
//! Every runtime option and its default lives here. Values are read from the
//! environment once at startup (with optional `.env` support provided by the
//! caller) into an immutable [`Config`] which is then passed explicitly to
//! each component. Nothing else in the crate calls `env::var`.
use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, bail, Result};

/// Parse an optional unsigned integer environment variable with a default value.
macro_rules! parse_env_u64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional float environment variable with a default value.
macro_rules! parse_env_f64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<f64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean environment variable with a default value.
macro_rules! parse_env_bool {
    ($var_name:expr, $default:expr) => {
        match env::var($var_name).ok().as_deref().map(str::trim) {
            None => $default,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => bail!("Invalid {}: expected true/false, got {:?}", $var_name, other),
        }
    };
}

pub const DEFAULT_SENSORS: &str = "sensor1=Dow's Lake,sensor2=NAC,sensor3=Fifth Avenue";

/// Upper bound for every second-valued duration option (one year).
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

/// Seconds as a signed chrono duration, saturating instead of panicking.
fn signed_seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// What a producer does when the ingestion channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    Block,
    Drop,
}

impl FromStr for BackpressurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "drop" => Ok(BackpressurePolicy::Drop),
            other => Err(anyhow!("onBackpressure must be block or drop, got {:?}", other)),
        }
    }
}

/// A simulated sensor and the location it is installed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorBinding {
    pub source_id: String,
    pub location: String,
}

impl SensorBinding {
    pub fn new(source_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            location: location.into(),
        }
    }
}

/// Parse `id=location` pairs separated by commas.
pub fn parse_sensor_bindings(raw: &str) -> Result<Vec<SensorBinding>> {
    // ---
    let mut bindings = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, location) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid SENSORS entry {:?}: expected id=location", entry))?;
        let (id, location) = (id.trim(), location.trim());
        if id.is_empty() || location.is_empty() {
            bail!("Invalid SENSORS entry {:?}: empty id or location", entry);
        }
        if bindings.iter().any(|b: &SensorBinding| b.source_id == id) {
            bail!("Invalid SENSORS: duplicate source id {:?}", id);
        }
        bindings.push(SensorBinding::new(id, location));
    }
    Ok(bindings)
}

/// Threshold rules applied to every raw reading.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyThresholds {
    /// Alert when iceThickness is strictly below this (cm).
    pub min_ice_thickness_cm: f64,
    /// Alert when externalTemperature is strictly above this (°C).
    pub melt_risk_external_temp_c: f64,
    /// Alert when surfaceTemperature is strictly above this (°C).
    pub max_surface_temp_c: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            min_ice_thickness_cm: 30.0,
            melt_risk_external_temp_c: -2.0,
            max_surface_temp_c: 0.0,
        }
    }
}

/// Strongly typed pipeline configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Tumbling window length in seconds.
    pub window_length_secs: u64,

    /// Producer emission interval in seconds.
    pub cadence_secs: u64,

    /// How far the watermark trails the newest event time.
    pub grace_secs: u64,

    pub on_backpressure: BackpressurePolicy,

    /// Retries after the first failed write attempt.
    pub sink_retry_count: u32,

    /// Bound on waiting for queued writes at shutdown.
    pub drain_timeout_secs: u64,

    /// Ingestion HTTP bind address.
    pub listen_addr: SocketAddr,

    /// Filesystem sink root; objects land under `<root>/output/...`.
    pub output_root: PathBuf,

    pub channel_capacity: usize,

    /// Alerts waiting for delivery; beyond this they are dropped and counted.
    pub alert_queue_capacity: usize,

    pub sink_workers: usize,

    pub sink_write_timeout_ms: u64,

    pub sink_backoff_ms: u64,

    /// Aggregator wakes this often to advance the watermark without traffic.
    pub watermark_tick_secs: u64,

    pub idle_watermark_advance: bool,

    pub simulate_sensors: bool,

    pub sensors: Vec<SensorBinding>,

    pub safety: SafetyThresholds,

    /// Suppress repeats of the same (sensor, location, rule) alert within
    /// this many seconds. Zero disables suppression.
    pub alert_suppress_secs: u64,

    pub alert_webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_length_secs: 300,
            cadence_secs: 10,
            grace_secs: 0,
            on_backpressure: BackpressurePolicy::Block,
            sink_retry_count: 3,
            drain_timeout_secs: 30,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            output_root: PathBuf::from("./data"),
            channel_capacity: 1024,
            alert_queue_capacity: 1024,
            sink_workers: 2,
            sink_write_timeout_ms: 5_000,
            sink_backoff_ms: 200,
            watermark_tick_secs: 5,
            idle_watermark_advance: true,
            simulate_sensors: true,
            sensors: parse_sensor_bindings(DEFAULT_SENSORS).unwrap_or_default(),
            safety: SafetyThresholds::default(),
            alert_suppress_secs: 0,
            alert_webhook_url: None,
        }
    }
}

/// Load configuration from environment variables with defaults.
///
/// Every variable is optional and falls back to [`Config::default`].
/// Returns an error if any variable is present but invalid, or if the
/// resulting configuration fails [`Config::validate`].
pub fn load_from_env() -> Result<Config> {
    // ---
    let defaults = Config::default();

    let on_backpressure = match env::var("ON_BACKPRESSURE") {
        Ok(v) => v.parse()?,
        Err(_) => defaults.on_backpressure,
    };
    let listen_addr = match env::var("LISTEN_ADDR") {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid LISTEN_ADDR: {}", e))?,
        Err(_) => defaults.listen_addr,
    };
    let sensors = match env::var("SENSORS") {
        Ok(v) => parse_sensor_bindings(&v)?,
        Err(_) => defaults.sensors,
    };
    let sink_retry_count = u32::try_from(parse_env_u64!(
        "SINK_RETRY_COUNT",
        u64::from(defaults.sink_retry_count)
    ))
    .map_err(|e| anyhow!("Invalid SINK_RETRY_COUNT: {}", e))?;

    let cfg = Config {
        window_length_secs: parse_env_u64!("WINDOW_LENGTH_SECONDS", defaults.window_length_secs),
        cadence_secs: parse_env_u64!("CADENCE_SECONDS", defaults.cadence_secs),
        grace_secs: parse_env_u64!("GRACE_SECONDS", defaults.grace_secs),
        on_backpressure,
        sink_retry_count,
        drain_timeout_secs: parse_env_u64!("DRAIN_TIMEOUT_SECONDS", defaults.drain_timeout_secs),
        listen_addr,
        output_root: env::var("OUTPUT_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_root),
        channel_capacity: parse_env_u64!("CHANNEL_CAPACITY", defaults.channel_capacity as u64)
            as usize,
        alert_queue_capacity: parse_env_u64!(
            "ALERT_QUEUE_CAPACITY",
            defaults.alert_queue_capacity as u64
        ) as usize,
        sink_workers: parse_env_u64!("SINK_WORKERS", defaults.sink_workers as u64) as usize,
        sink_write_timeout_ms: parse_env_u64!(
            "SINK_WRITE_TIMEOUT_MS",
            defaults.sink_write_timeout_ms
        ),
        sink_backoff_ms: parse_env_u64!("SINK_BACKOFF_MS", defaults.sink_backoff_ms),
        watermark_tick_secs: parse_env_u64!(
            "WATERMARK_TICK_SECONDS",
            defaults.watermark_tick_secs
        ),
        idle_watermark_advance: parse_env_bool!(
            "IDLE_WATERMARK_ADVANCE",
            defaults.idle_watermark_advance
        ),
        simulate_sensors: parse_env_bool!("SIMULATE_SENSORS", defaults.simulate_sensors),
        sensors,
        safety: SafetyThresholds {
            min_ice_thickness_cm: parse_env_f64!(
                "MIN_ICE_THICKNESS_CM",
                defaults.safety.min_ice_thickness_cm
            ),
            melt_risk_external_temp_c: parse_env_f64!(
                "MELT_RISK_EXTERNAL_TEMP_C",
                defaults.safety.melt_risk_external_temp_c
            ),
            max_surface_temp_c: parse_env_f64!(
                "MAX_SURFACE_TEMP_C",
                defaults.safety.max_surface_temp_c
            ),
        },
        alert_suppress_secs: parse_env_u64!("ALERT_SUPPRESS_SECONDS", defaults.alert_suppress_secs),
        alert_webhook_url: env::var("ALERT_WEBHOOK_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
    };

    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    // ---
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.window_length_secs == 0 {
            bail!("WINDOW_LENGTH_SECONDS must be greater than zero");
        }
        for (name, secs) in [
            ("WINDOW_LENGTH_SECONDS", self.window_length_secs),
            ("CADENCE_SECONDS", self.cadence_secs),
            ("GRACE_SECONDS", self.grace_secs),
            ("DRAIN_TIMEOUT_SECONDS", self.drain_timeout_secs),
            ("WATERMARK_TICK_SECONDS", self.watermark_tick_secs),
            ("ALERT_SUPPRESS_SECONDS", self.alert_suppress_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                bail!("{} must be at most {} seconds, got {}", name, MAX_DURATION_SECS, secs);
            }
        }
        if self.cadence_secs == 0 {
            bail!("CADENCE_SECONDS must be greater than zero");
        }
        if self.watermark_tick_secs == 0 {
            bail!("WATERMARK_TICK_SECONDS must be greater than zero");
        }
        if self.channel_capacity == 0 || self.alert_queue_capacity == 0 {
            bail!("CHANNEL_CAPACITY and ALERT_QUEUE_CAPACITY must be greater than zero");
        }
        if self.sink_workers == 0 {
            bail!("SINK_WORKERS must be greater than zero");
        }
        if self.sink_write_timeout_ms == 0 {
            bail!("SINK_WRITE_TIMEOUT_MS must be greater than zero");
        }
        if self.simulate_sensors && self.sensors.is_empty() {
            bail!("SIMULATE_SENSORS is on but SENSORS is empty");
        }
        Ok(())
    }

    pub fn window_length(&self) -> chrono::Duration {
        signed_seconds(self.window_length_secs)
    }

    pub fn grace(&self) -> chrono::Duration {
        signed_seconds(self.grace_secs)
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn watermark_tick(&self) -> Duration {
        Duration::from_secs(self.watermark_tick_secs)
    }

    pub fn sink_write_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_write_timeout_ms)
    }

    pub fn sink_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_ms)
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// The webhook URL may carry a token in its query string, so only the
    /// part before `?` is shown.
    pub fn log_config(&self) {
        // ---
        let webhook = self
            .alert_webhook_url
            .as_deref()
            .map(|url| url.split('?').next().unwrap_or(url).to_string())
            .unwrap_or_else(|| "(log only)".to_string());
        let sensors: Vec<String> = self
            .sensors
            .iter()
            .map(|b| format!("{}@{}", b.source_id, b.location))
            .collect();

        tracing::info!("Configuration loaded:");
        tracing::info!("  WINDOW_LENGTH_SECONDS : {}", self.window_length_secs);
        tracing::info!("  CADENCE_SECONDS       : {}", self.cadence_secs);
        tracing::info!("  GRACE_SECONDS         : {}", self.grace_secs);
        tracing::info!("  ON_BACKPRESSURE       : {:?}", self.on_backpressure);
        tracing::info!("  SINK_RETRY_COUNT      : {}", self.sink_retry_count);
        tracing::info!("  DRAIN_TIMEOUT_SECONDS : {}", self.drain_timeout_secs);
        tracing::info!("  LISTEN_ADDR           : {}", self.listen_addr);
        tracing::info!("  OUTPUT_ROOT           : {}", self.output_root.display());
        tracing::info!("  CHANNEL_CAPACITY      : {}", self.channel_capacity);
        tracing::info!("  SINK_WORKERS          : {}", self.sink_workers);
        tracing::info!("  SIMULATE_SENSORS      : {}", self.simulate_sensors);
        tracing::info!("  SENSORS               : {}", sensors.join(", "));
        tracing::info!("  SAFETY                : {:?}", self.safety);
        tracing::info!("  ALERT_SUPPRESS_SECONDS: {}", self.alert_suppress_secs);
        tracing::info!("  ALERT_WEBHOOK_URL     : {}", webhook);
    }
}
