use crate::types::{Anomaly, Device, Point};
use serde::Serialize;

/// Event published on the in-process bus for dashboard fanout.
///
/// Every variant is JSON-serialisable; the `type` tag matches the wire
/// protocol consumed by dashboard sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    #[serde(rename = "metric:new")]
    MetricNew {
        #[serde(rename = "deviceId")]
        device_id: String,
        metric: Point,
    },
    #[serde(rename = "anomaly:new")]
    AnomalyNew {
        #[serde(rename = "deviceId")]
        device_id: String,
        anomaly: Anomaly,
    },
    #[serde(rename = "device:update")]
    DeviceUpdate {
        #[serde(rename = "deviceId")]
        device_id: String,
        device: Device,
    },
}

impl BusEvent {
    /// The device this event belongs to, used for topic routing.
    pub fn device_id(&self) -> &str {
        match self {
            BusEvent::MetricNew { device_id, .. }
            | BusEvent::AnomalyNew { device_id, .. }
            | BusEvent::DeviceUpdate { device_id, .. } => device_id,
        }
    }
}
