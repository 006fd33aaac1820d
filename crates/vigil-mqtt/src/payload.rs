use chrono::{DateTime, Utc};
use serde::Deserialize;
use vigil_domain::{DomainError, DomainResult};
use vigil_pipeline::RawMeasurement;

/// Wildcard pattern the bridge subscribes to; the single-level wildcard is
/// the device id.
pub const TOPIC_PATTERN: &str = "sensors/+/metrics";

/// Parse an MQTT topic in the format `sensors/{device_id}/metrics`.
pub fn parse_topic(topic: &str) -> DomainResult<&str> {
    let mut segments = topic.split('/');
    match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some("sensors"), Some(device_id), Some("metrics"), None) if !device_id.trim().is_empty() => {
            Ok(device_id)
        }
        _ => Err(DomainError::InvalidDeviceId(format!(
            "unexpected topic format '{}'",
            topic
        ))),
    }
}

/// A single point as published by a device agent, optionally carrying its
/// position.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttPoint {
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    pub temperature_c: f64,
    pub vibration_g: f64,
    pub humidity_pct: f64,
    pub voltage_v: f64,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

impl MqttPoint {
    pub fn into_measurement(self) -> RawMeasurement {
        RawMeasurement {
            ts: self.ts,
            temperature_c: self.temperature_c,
            vibration_g: self.vibration_g,
            humidity_pct: self.humidity_pct,
            voltage_v: self.voltage_v,
        }
    }
}

/// Decode a JSON payload into a point.
pub fn decode_payload(payload: &[u8]) -> DomainResult<MqttPoint> {
    serde_json::from_slice(payload)
        .map_err(|e| DomainError::InvalidPoint(format!("undecodable payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_topic() {
        assert_eq!(parse_topic("sensors/dev42/metrics").unwrap(), "dev42");
    }

    #[test]
    fn test_parse_topic_with_underscores() {
        assert_eq!(
            parse_topic("sensors/pump_house_01/metrics").unwrap(),
            "pump_house_01"
        );
    }

    #[test]
    fn test_parse_topic_wrong_prefix() {
        assert!(parse_topic("telemetry/dev42/metrics").is_err());
    }

    #[test]
    fn test_parse_topic_wrong_suffix() {
        assert!(parse_topic("sensors/dev42/status").is_err());
    }

    #[test]
    fn test_parse_topic_extra_segments() {
        assert!(parse_topic("sensors/dev42/metrics/extra").is_err());
    }

    #[test]
    fn test_parse_topic_empty_device() {
        assert!(parse_topic("sensors//metrics").is_err());
    }

    #[test]
    fn test_decode_payload_without_location() {
        let point = decode_payload(
            br#"{"ts":"2026-08-02T10:00:00Z","temperature_c":22.5,"vibration_g":0.12,"humidity_pct":41.0,"voltage_v":11.9}"#,
        )
        .unwrap();
        assert_eq!(point.temperature_c, 22.5);
        assert!(point.lat.is_none());
        assert!(point.ts.is_some());
    }

    #[test]
    fn test_decode_payload_with_location() {
        let point = decode_payload(
            br#"{"temperature_c":22.5,"vibration_g":0.12,"humidity_pct":41.0,"voltage_v":11.9,"lat":37.3,"lng":-121.9}"#,
        )
        .unwrap();
        assert_eq!(point.lat, Some(37.3));
        assert_eq!(point.lng, Some(-121.9));
        assert!(point.ts.is_none());
    }

    #[test]
    fn test_decode_payload_rejects_missing_metric() {
        let result = decode_payload(br#"{"temperature_c":22.5}"#);
        assert!(matches!(result, Err(DomainError::InvalidPoint(_))));
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        assert!(decode_payload(b"\x01\x02\x03").is_err());
    }
}
