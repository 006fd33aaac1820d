use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// The detector variant that produced a score.
///
/// Anomaly records carry the detector that actually scored them, which may
/// differ from the configured engine when the external scorer falls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorKind {
    #[serde(rename = "zscore")]
    ZScore,
    #[serde(rename = "median-deviation")]
    MedianDeviation,
    #[serde(rename = "external")]
    External,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::ZScore => "zscore",
            DetectorKind::MedianDeviation => "median-deviation",
            DetectorKind::External => "external",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zscore" => Some(DetectorKind::ZScore),
            "median-deviation" => Some(DetectorKind::MedianDeviation),
            "external" => Some(DetectorKind::External),
            _ => None,
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain entity for a registered device.
///
/// Location is stored as numeric lat/lng when the device reported
/// coordinates, with a free-text fallback for API-created devices. Reads
/// render the legacy `lat:<lat>,lng:<lng>` string for wire compatibility.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub location: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Render the location the way clients expect it: coordinates win over
    /// free text, formatted as `lat:<lat>,lng:<lng>`.
    pub fn location_label(&self) -> Option<String> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(format!("lat:{},lng:{}", lat, lng)),
            _ => self.location.clone(),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Device", 4)?;
        state.serialize_field("id", &self.device_id)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("location", &self.location_label())?;
        state.serialize_field("createdAt", &self.created_at)?;
        state.end()
    }
}

/// Per-device metric and anomaly totals attached to device reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub metrics: i64,
    pub anomalies: i64,
}

/// A device joined with its row counts, as returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceWithCounts {
    #[serde(flatten)]
    pub device: Device,
    #[serde(rename = "_count")]
    pub counts: EntityCounts,
}

/// One multidimensional measurement from one device at one instant.
///
/// `id` is assigned by the store on insert; points handed to the pipeline
/// before persistence carry `None`. Immutable after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub temperature_c: f64,
    pub vibration_g: f64,
    pub humidity_pct: f64,
    pub voltage_v: f64,
}

impl Point {
    /// The four measurements in canonical order.
    pub fn features(&self) -> [f64; 4] {
        [
            self.temperature_c,
            self.vibration_g,
            self.humidity_pct,
            self.voltage_v,
        ]
    }

    /// True when every measurement is a finite number.
    pub fn is_finite(&self) -> bool {
        self.features().iter().all(|v| v.is_finite())
    }
}

/// A scored point that crossed the detector threshold.
///
/// `point_id` is nullable: a retention job may remove the referenced point
/// while the anomaly record is kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub id: Option<i64>,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "pointId")]
    pub point_id: Option<i64>,
    pub ts: DateTime<Utc>,
    pub score: f64,
    #[serde(rename = "type")]
    pub detector: DetectorKind,
    pub flagged: bool,
}
