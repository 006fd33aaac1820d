use crate::payload::{decode_payload, parse_topic, TOPIC_PATTERN};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vigil_domain::{DomainError, DomainResult};
use vigil_pipeline::{IngestionPipeline, RawMeasurement};

#[derive(Debug, Clone)]
pub struct MqttBridgeConfig {
    pub broker_url: String,
    /// Flush a device buffer when it reaches this many points.
    pub batch_size: usize,
    /// Flush every buffer at least this often.
    pub flush_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for MqttBridgeConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            batch_size: 64,
            flush_interval: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Per-device buffers for incoming single-point messages.
///
/// Whichever trigger fires first wins: the size threshold flushes one device
/// inline, the interval tick flushes everything.
struct BatchBuffers {
    capacity: usize,
    buffers: HashMap<String, Vec<RawMeasurement>>,
}

impl BatchBuffers {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: HashMap::new(),
        }
    }

    /// Append a point; returns the full buffer when the size trigger fires.
    fn push(&mut self, device_id: &str, measurement: RawMeasurement) -> Option<Vec<RawMeasurement>> {
        let buffer = self.buffers.entry(device_id.to_string()).or_default();
        buffer.push(measurement);
        if buffer.len() >= self.capacity {
            Some(std::mem::take(buffer))
        } else {
            None
        }
    }

    fn drain_all(&mut self) -> Vec<(String, Vec<RawMeasurement>)> {
        self.buffers
            .iter_mut()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(device_id, buffer)| (device_id.clone(), std::mem::take(buffer)))
            .collect()
    }
}

/// MQTT edge: subscribes to the sensor wildcard, decodes single-point
/// payloads, and hands batches to the pipeline.
///
/// The broker is treated as best-effort: connection loss reconnects forever
/// at a fixed period and never takes the process down.
pub struct MqttBridge {
    pipeline: Arc<IngestionPipeline>,
    config: MqttBridgeConfig,
}

impl MqttBridge {
    pub fn new(pipeline: Arc<IngestionPipeline>, config: MqttBridgeConfig) -> Self {
        Self { pipeline, config }
    }

    /// Run the bridge until shutdown. Always returns Ok: broker trouble is a
    /// warning, not a process failure.
    #[instrument(name = "mqtt_bridge", skip_all, fields(broker_url = %self.config.broker_url))]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_connection(&shutdown).await {
                Ok(()) => {
                    debug!("MQTT bridge stopped cleanly");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, reconnecting");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }

        info!("MQTT bridge stopped");
        Ok(())
    }

    /// Run a single MQTT connection session.
    async fn run_connection(&self, shutdown: &CancellationToken) -> DomainResult<()> {
        let (host, port) = parse_broker_url(&self.config.broker_url)?;

        let client_id = format!("vigil-bridge-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        client
            .subscribe(TOPIC_PATTERN, QoS::AtMostOnce)
            .await
            .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!("subscribe failed: {}", e)))?;

        info!(topic = TOPIC_PATTERN, "subscribed to MQTT topic");

        let mut buffers = BatchBuffers::new(self.config.batch_size);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("shutdown signal received");
                    let _ = client.disconnect().await;
                    self.flush_all(&mut buffers).await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.flush_all(&mut buffers).await;
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.handle_message(&publish.topic, &publish.payload, &mut buffers)
                                .await;
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.flush_all(&mut buffers).await;
                            return Err(DomainError::RepositoryError(anyhow::anyhow!(
                                "MQTT event loop error: {}",
                                e
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Decode one message, record any reported location, and buffer the
    /// point. Malformed messages are dropped with a warning.
    pub(crate) async fn handle_message(
        &self,
        topic: &str,
        payload: &[u8],
        buffers: &mut BatchBuffers,
    ) {
        let device_id = match parse_topic(topic) {
            Ok(device_id) => device_id,
            Err(e) => {
                warn!(topic = %topic, error = %e, "skipping message with bad topic");
                return;
            }
        };

        let point = match decode_payload(payload) {
            Ok(point) => point,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "skipping undecodable payload");
                return;
            }
        };

        if let (Some(lat), Some(lng)) = (point.lat, point.lng) {
            if let Err(e) = self
                .pipeline
                .update_device_location(device_id, lat, lng)
                .await
            {
                warn!(device_id = %device_id, error = %e, "failed to record device location");
            }
        }

        if let Some(batch) = buffers.push(device_id, point.into_measurement()) {
            self.flush(device_id, batch).await;
        }
    }

    async fn flush_all(&self, buffers: &mut BatchBuffers) {
        for (device_id, batch) in buffers.drain_all() {
            self.flush(&device_id, batch).await;
        }
    }

    async fn flush(&self, device_id: &str, batch: Vec<RawMeasurement>) {
        let count = batch.len();
        if let Err(e) = self.pipeline.ingest_buffered(device_id, batch).await {
            warn!(
                device_id = %device_id,
                points = count,
                error = %e,
                "dropping MQTT batch"
            );
        }
    }
}

/// Parse a broker URL in the format mqtt://host:port, tcp://host:port or
/// host:port.
fn parse_broker_url(url: &str) -> DomainResult<(&str, u16)> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    match url.split_once(':') {
        None if !url.is_empty() => Ok((url, 1883)),
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DomainError::InvalidDeviceId(format!("invalid port in broker URL: {}", port))
            })?;
            Ok((host, port))
        }
        _ => Err(DomainError::InvalidDeviceId(format!(
            "invalid broker URL: {}",
            url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use vigil_bus::EventBus;
    use vigil_detect::{DetectorRegistry, RegistryConfig};
    use vigil_domain::{
        BusEvent, Device, DetectorKind, MockAnomalyRepository, MockDeviceRepository,
        MockPointRepository,
    };
    use vigil_pipeline::PipelineConfig;

    fn measurement(temperature: f64) -> RawMeasurement {
        serde_json::from_value(serde_json::json!({
            "temperature_c": temperature,
            "vibration_g": 0.1,
            "humidity_pct": 40.0,
            "voltage_v": 12.0,
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_broker_url_with_scheme_and_port() {
        let (host, port) = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_tcp_scheme() {
        let (host, port) = parse_broker_url("tcp://broker.local:8883").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 8883);
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        let (host, port) = parse_broker_url("mqtt://broker.local").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_invalid_port() {
        assert!(parse_broker_url("mqtt://broker.local:abc").is_err());
    }

    #[test]
    fn test_size_trigger_flushes_single_device() {
        let mut buffers = BatchBuffers::new(3);
        assert!(buffers.push("dev-1", measurement(22.0)).is_none());
        assert!(buffers.push("dev-2", measurement(22.0)).is_none());
        assert!(buffers.push("dev-1", measurement(23.0)).is_none());

        let batch = buffers.push("dev-1", measurement(24.0)).unwrap();
        assert_eq!(batch.len(), 3);
        // dev-2 is untouched and dev-1 starts over.
        assert!(buffers.push("dev-1", measurement(25.0)).is_none());
    }

    #[test]
    fn test_drain_all_takes_every_pending_buffer() {
        let mut buffers = BatchBuffers::new(64);
        buffers.push("dev-1", measurement(22.0));
        buffers.push("dev-2", measurement(23.0));
        buffers.push("dev-2", measurement(24.0));

        let mut drained = buffers.drain_all();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1.len(), 1);
        assert_eq!(drained[1].1.len(), 2);
        assert!(buffers.drain_all().is_empty());
    }

    fn test_pipeline(
        devices: MockDeviceRepository,
        points: MockPointRepository,
    ) -> (Arc<IngestionPipeline>, Arc<EventBus>) {
        let mut anomalies = MockAnomalyRepository::new();
        anomalies.expect_insert_anomalies().returning(|batch| {
            Ok((0..batch.len())
                .map(|index| (index, index as i64 + 1))
                .collect())
        });
        let bus = Arc::new(EventBus::default());
        let registry = Arc::new(
            DetectorRegistry::new(RegistryConfig {
                engine: DetectorKind::ZScore,
                ..Default::default()
            })
            .unwrap(),
        );
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::new(devices),
            Arc::new(points),
            Arc::new(anomalies),
            registry,
            Arc::clone(&bus),
            PipelineConfig::default(),
            CancellationToken::new(),
        ));
        (pipeline, bus)
    }

    fn device(device_id: &str) -> Device {
        Device {
            device_id: device_id.to_string(),
            name: device_id.to_string(),
            location: None,
            lat: None,
            lng: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_message_with_location_updates_device() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_upsert_device()
            .returning(|input| Ok(device(&input.device_id)));
        devices
            .expect_update_location()
            .withf(|device_id: &str, lat: &f64, lng: &f64| {
                device_id == "dev42" && *lat == 37.3 && *lng == -121.9
            })
            .times(1)
            .returning(|device_id, lat, lng| {
                let mut d = device(device_id);
                d.lat = Some(lat);
                d.lng = Some(lng);
                Ok(d)
            });
        let (pipeline, bus) = test_pipeline(devices, MockPointRepository::new());
        let mut firehose = bus.subscribe_firehose();

        let bridge = MqttBridge::new(pipeline, MqttBridgeConfig::default());
        let mut buffers = BatchBuffers::new(64);
        bridge
            .handle_message(
                "sensors/dev42/metrics",
                br#"{"temperature_c":22.5,"vibration_g":0.12,"humidity_pct":41.0,"voltage_v":11.9,"lat":37.3,"lng":-121.9}"#,
                &mut buffers,
            )
            .await;

        match firehose.recv().await.unwrap() {
            BusEvent::DeviceUpdate { device_id, device } => {
                assert_eq!(device_id, "dev42");
                assert_eq!(device.location_label().unwrap(), "lat:37.3,lng:-121.9");
            }
            other => panic!("unexpected event {:?}", other),
        }
        // The point itself is buffered, not yet ingested.
        assert_eq!(buffers.buffers["dev42"].len(), 1);
    }

    #[tokio::test]
    async fn test_bad_topic_and_payload_are_dropped() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_upsert_device().times(0);
        let mut points = MockPointRepository::new();
        points.expect_insert_points().times(0);
        let (pipeline, _bus) = test_pipeline(devices, points);

        let bridge = MqttBridge::new(pipeline, MqttBridgeConfig::default());
        let mut buffers = BatchBuffers::new(64);
        bridge
            .handle_message("sensors/dev42/status", b"{}", &mut buffers)
            .await;
        bridge
            .handle_message("sensors/dev42/metrics", b"not json", &mut buffers)
            .await;
        assert!(buffers.buffers.is_empty());
    }
}
