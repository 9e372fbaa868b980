//! Data models for the ice-condition pipeline.
//!
//! `TelemetryPayload` is the wire shape accepted at the ingestion boundary;
//! it is validated into an immutable [`Reading`] before anything downstream
//! sees it. [`AggregateRecord`] and [`AlertEvent`] are the two outputs.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

// ---

/// One sensor observation, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    // ---
    pub source_id: String,
    pub location: String,
    pub surface_temperature: f64,
    pub external_temperature: f64,
    pub ice_thickness: f64,
    pub snow_accumulation: f64,
    pub humidity: Option<f64>,
    /// UTC, whole seconds.
    pub timestamp: DateTime<Utc>,
}

/// Raw JSON body posted by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    // ---
    pub surface_temperature: f64,
    pub external_temperature: f64,
    pub ice_thickness: f64,
    pub snow_accumulation: f64,
    pub location: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
}

impl TelemetryPayload {
    // ---
    /// Parse a request body. Missing fields, wrong types and invalid JSON
    /// all surface as [`PayloadError::Json`].
    pub fn from_slice(body: &[u8]) -> Result<Self, PayloadError> {
        // ---
        serde_json::from_slice(body).map_err(PayloadError::Json)
    }

    /// Validate and bind the payload to the device that sent it.
    pub fn into_reading(self, source_id: &str) -> Result<Reading, PayloadError> {
        // ---
        let source_id = source_id.trim();
        if source_id.is_empty() {
            return Err(PayloadError::EmptyField("sourceId"));
        }
        let location = self.location.trim();
        if location.is_empty() {
            return Err(PayloadError::EmptyField("location"));
        }

        for (field, value) in [
            ("surfaceTemperature", self.surface_temperature),
            ("externalTemperature", self.external_temperature),
            ("iceThickness", self.ice_thickness),
            ("snowAccumulation", self.snow_accumulation),
        ] {
            if !value.is_finite() {
                return Err(PayloadError::NonFinite(field));
            }
        }
        if let Some(humidity) = self.humidity {
            if !humidity.is_finite() {
                return Err(PayloadError::NonFinite("humidity"));
            }
        }

        let timestamp = DateTime::parse_from_rfc3339(self.timestamp.trim())
            .map_err(|e| PayloadError::Timestamp(self.timestamp.clone(), e))?
            .with_timezone(&Utc)
            .trunc_subsecs(0);

        Ok(Reading {
            source_id: source_id.to_string(),
            location: location.to_string(),
            surface_temperature: self.surface_temperature,
            external_temperature: self.external_temperature,
            ice_thickness: self.ice_thickness,
            snow_accumulation: self.snow_accumulation,
            humidity: self.humidity,
            timestamp,
        })
    }
}

/// Identity of one aggregation bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    // ---
    pub source_id: String,
    pub location: String,
    pub window_start: DateTime<Utc>,
}

/// Output of one closed window, in the column naming of the blob layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    // ---
    #[serde(rename = "DeviceId")]
    pub source_id: String,
    #[serde(rename = "location")]
    pub location: String,
    #[serde(rename = "AvgIceThickness")]
    pub avg_ice_thickness: f64,
    #[serde(rename = "AvgSnowAccumulation")]
    pub avg_snow_accumulation: f64,
    #[serde(rename = "AvgExternalTemperature")]
    pub avg_external_temperature: f64,
    #[serde(rename = "AvgSurfaceTemperature")]
    pub avg_surface_temperature: f64,
    /// Inclusive window start.
    #[serde(rename = "EventTime")]
    pub event_time: DateTime<Utc>,
    /// Number of readings folded into the averages. Not part of the stored object.
    #[serde(skip)]
    pub reading_count: u64,
}

impl AggregateRecord {
    // ---
    pub fn key(&self) -> WindowKey {
        WindowKey {
            source_id: self.source_id.clone(),
            location: self.location.clone(),
            window_start: self.event_time,
        }
    }
}

/// Which safety rule a reading violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyRule {
    IceThicknessBelowMinimum,
    ExternalTemperatureMeltRisk,
    SurfaceTemperatureMelt,
}

impl SafetyRule {
    /// Reading field the rule inspects, in wire naming.
    pub fn field(self) -> &'static str {
        match self {
            SafetyRule::IceThicknessBelowMinimum => "iceThickness",
            SafetyRule::ExternalTemperatureMeltRisk => "externalTemperature",
            SafetyRule::SurfaceTemperatureMelt => "surfaceTemperature",
        }
    }
}

/// One violation of one rule by one reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    // ---
    pub source_id: String,
    pub location: String,
    pub field: String,
    pub value: f64,
    pub rule: SafetyRule,
    pub timestamp: DateTime<Utc>,
}
