use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vigil_bus::EventBus;
use vigil_detect::{DetectorRegistry, MockScoreRpc, RegistryConfig};
use vigil_domain::{
    BusEvent, Device, DetectorKind, DomainError, MockAnomalyRepository, MockDeviceRepository,
    MockPointRepository,
};
use vigil_pipeline::{IngestionPipeline, PipelineConfig, RawMeasurement};

fn measurement(temperature: f64) -> RawMeasurement {
    serde_json::from_value(serde_json::json!({
        "temperature_c": temperature,
        "vibration_g": 0.1,
        "humidity_pct": 40.0,
        "voltage_v": 12.0,
    }))
    .unwrap()
}

fn test_device(device_id: &str) -> Device {
    Device {
        device_id: device_id.to_string(),
        name: device_id.to_string(),
        location: None,
        lat: None,
        lng: None,
        created_at: Some(chrono::Utc::now()),
        updated_at: Some(chrono::Utc::now()),
    }
}

/// Device repository that provisions anything on first contact.
fn provisioning_device_repo() -> MockDeviceRepository {
    let mut repo = MockDeviceRepository::new();
    repo.expect_upsert_device()
        .returning(|input| Ok(test_device(&input.device_id)));
    repo
}

/// Point repository handing out sequential ids, like a bigserial column.
fn sequential_point_repo() -> MockPointRepository {
    let mut repo = MockPointRepository::new();
    let next_id = Arc::new(AtomicI64::new(0));
    repo.expect_insert_points().returning(move |points| {
        let start = next_id.fetch_add(points.len() as i64, Ordering::SeqCst) + 1;
        Ok((start..start + points.len() as i64).collect())
    });
    // Fresh workers warm their windows from history; none exists here.
    repo.expect_list_points().returning(|_| Ok(Vec::new()));
    repo
}

fn sequential_anomaly_repo(first_id: i64) -> MockAnomalyRepository {
    let mut repo = MockAnomalyRepository::new();
    let next_id = Arc::new(AtomicI64::new(first_id));
    repo.expect_insert_anomalies().returning(move |anomalies| {
        let start = next_id.fetch_add(anomalies.len() as i64, Ordering::SeqCst);
        Ok((0..anomalies.len())
            .map(|index| (index, start + index as i64))
            .collect())
    });
    repo
}

fn zscore_registry() -> Arc<DetectorRegistry> {
    Arc::new(
        DetectorRegistry::new(RegistryConfig {
            engine: DetectorKind::ZScore,
            ..Default::default()
        })
        .unwrap(),
    )
}

struct Harness {
    pipeline: IngestionPipeline,
    bus: Arc<EventBus>,
    token: CancellationToken,
}

fn harness(
    devices: MockDeviceRepository,
    points: MockPointRepository,
    anomalies: MockAnomalyRepository,
    detectors: Arc<DetectorRegistry>,
    config: PipelineConfig,
) -> Harness {
    let bus = Arc::new(EventBus::default());
    let token = CancellationToken::new();
    let pipeline = IngestionPipeline::new(
        Arc::new(devices),
        Arc::new(points),
        Arc::new(anomalies),
        detectors,
        Arc::clone(&bus),
        config,
        token.clone(),
    );
    Harness {
        pipeline,
        bus,
        token,
    }
}

fn metric_id(event: &BusEvent) -> Option<i64> {
    match event {
        BusEvent::MetricNew { metric, .. } => metric.id,
        _ => None,
    }
}

#[tokio::test]
async fn test_metric_events_follow_arrival_order() {
    let h = harness(
        provisioning_device_repo(),
        sequential_point_repo(),
        sequential_anomaly_repo(1),
        zscore_registry(),
        PipelineConfig::default(),
    );
    let mut firehose = h.bus.subscribe_firehose();

    let batch: Vec<RawMeasurement> = (0..20).map(|_| measurement(22.0)).collect();
    let summary = h.pipeline.ingest_http_batch("dev-1", batch).await.unwrap();
    assert_eq!(summary.inserted, 20);
    assert_eq!(summary.anomalies, 0);

    for expected in 1..=20 {
        let event = firehose.recv().await.unwrap();
        assert_eq!(metric_id(&event), Some(expected));
    }
}

#[tokio::test]
async fn test_spike_batch_reports_single_anomaly_with_persisted_id() {
    let h = harness(
        provisioning_device_repo(),
        sequential_point_repo(),
        sequential_anomaly_repo(100),
        zscore_registry(),
        PipelineConfig::default(),
    );
    let mut firehose = h.bus.subscribe_firehose();

    let mut batch: Vec<RawMeasurement> = (0..50).map(|_| measurement(22.0)).collect();
    batch.push(measurement(40.0));
    let summary = h.pipeline.ingest_http_batch("dev-1", batch).await.unwrap();
    assert_eq!(summary.inserted, 51);
    assert_eq!(summary.anomalies, 1);

    let mut anomaly_events = Vec::new();
    for _ in 0..52 {
        match firehose.recv().await.unwrap() {
            BusEvent::AnomalyNew { anomaly, .. } => anomaly_events.push(anomaly),
            BusEvent::MetricNew { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(anomaly_events.len(), 1);
    let anomaly = &anomaly_events[0];
    assert_eq!(anomaly.id, Some(100));
    assert_eq!(anomaly.point_id, Some(51));
    assert_eq!(anomaly.detector, DetectorKind::ZScore);
    assert!(anomaly.flagged);
}

#[tokio::test]
async fn test_auto_provision_disabled_rejects_unknown_device() {
    let mut devices = MockDeviceRepository::new();
    devices.expect_get_device().returning(|_| Ok(None));
    devices.expect_upsert_device().times(0);
    let mut points = MockPointRepository::new();
    points.expect_insert_points().times(0);

    let h = harness(
        devices,
        points,
        MockAnomalyRepository::new(),
        zscore_registry(),
        PipelineConfig {
            auto_provision: false,
            ..Default::default()
        },
    );

    let result = h
        .pipeline
        .ingest_http_batch("new", vec![measurement(22.0)])
        .await;
    assert!(matches!(result, Err(DomainError::DeviceNotFound(_))));
}

#[tokio::test]
async fn test_device_is_provisioned_once_then_cached() {
    let mut devices = MockDeviceRepository::new();
    devices
        .expect_upsert_device()
        .times(1)
        .returning(|input| Ok(test_device(&input.device_id)));

    let h = harness(
        devices,
        sequential_point_repo(),
        sequential_anomaly_repo(1),
        zscore_registry(),
        PipelineConfig::default(),
    );

    for _ in 0..3 {
        h.pipeline
            .ingest_http_batch("dev-1", vec![measurement(22.0)])
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_non_finite_measurement_rejects_http_batch() {
    let h = harness(
        provisioning_device_repo(),
        sequential_point_repo(),
        sequential_anomaly_repo(1),
        zscore_registry(),
        PipelineConfig::default(),
    );

    let mut bad = measurement(22.0);
    bad.humidity_pct = f64::NAN;
    let result = h.pipeline.ingest_http_batch("dev-1", vec![bad]).await;
    assert!(matches!(result, Err(DomainError::InvalidPoint(_))));
}

#[tokio::test]
async fn test_buffered_store_failure_drops_batch_and_counts() {
    let mut points = MockPointRepository::new();
    points
        .expect_insert_points()
        .returning(|_| Err(DomainError::RepositoryError(anyhow::anyhow!("pool down"))));
    points.expect_list_points().returning(|_| Ok(Vec::new()));

    let h = harness(
        provisioning_device_repo(),
        points,
        MockAnomalyRepository::new(),
        zscore_registry(),
        PipelineConfig::default(),
    );
    let mut firehose = h.bus.subscribe_firehose();

    h.pipeline
        .ingest_buffered("dev-1", vec![measurement(22.0), measurement(23.0)])
        .await
        .unwrap();

    let mut dropped = 0;
    for _ in 0..100 {
        dropped = h.pipeline.dropped_batches();
        if dropped == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(dropped, 1);
    assert!(firehose.try_recv().is_err());
}

#[tokio::test]
async fn test_http_store_failure_surfaces_to_caller() {
    let mut points = MockPointRepository::new();
    points
        .expect_insert_points()
        .returning(|_| Err(DomainError::RepositoryError(anyhow::anyhow!("pool down"))));
    points.expect_list_points().returning(|_| Ok(Vec::new()));

    let h = harness(
        provisioning_device_repo(),
        points,
        MockAnomalyRepository::new(),
        zscore_registry(),
        PipelineConfig::default(),
    );

    let result = h
        .pipeline
        .ingest_http_batch("dev-1", vec![measurement(22.0)])
        .await;
    assert!(matches!(result, Err(DomainError::RepositoryError(_))));
    assert_eq!(h.pipeline.dropped_batches(), 0);
}

#[tokio::test]
async fn test_shutdown_rejects_new_batches() {
    let h = harness(
        provisioning_device_repo(),
        sequential_point_repo(),
        sequential_anomaly_repo(1),
        zscore_registry(),
        PipelineConfig::default(),
    );
    h.token.cancel();
    let result = h
        .pipeline
        .ingest_http_batch("dev-1", vec![measurement(22.0)])
        .await;
    assert!(matches!(result, Err(DomainError::ShuttingDown)));
}

#[tokio::test]
async fn test_idle_worker_is_reaped_then_respawned() {
    let h = harness(
        provisioning_device_repo(),
        sequential_point_repo(),
        sequential_anomaly_repo(1),
        zscore_registry(),
        PipelineConfig {
            worker_idle_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );

    h.pipeline
        .ingest_http_batch("dev-1", vec![measurement(22.0)])
        .await
        .unwrap();
    assert_eq!(h.pipeline.active_workers().await, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.pipeline.active_workers().await, 0);

    // A fresh worker picks the device back up.
    h.pipeline
        .ingest_http_batch("dev-1", vec![measurement(22.0)])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_worker_warms_window_from_persisted_history() {
    // 50 nominal points already in the store: the first point a fresh
    // worker scores is judged against the reconstructed window.
    let mut points = MockPointRepository::new();
    points.expect_list_points().times(1).returning(|query| {
        assert_eq!(query.device_id.as_deref(), Some("dev-1"));
        let mut history: Vec<vigil_domain::Point> = (0..50)
            .map(|i| vigil_domain::Point {
                id: Some(50 - i),
                device_id: "dev-1".to_string(),
                ts: chrono::Utc::now(),
                temperature_c: 22.0,
                vibration_g: 0.1,
                humidity_pct: 40.0,
                voltage_v: 12.0,
            })
            .collect();
        history.truncate(query.limit as usize);
        Ok(history)
    });
    points
        .expect_insert_points()
        .returning(|batch| Ok((100..100 + batch.len() as i64).collect()));

    let h = harness(
        provisioning_device_repo(),
        points,
        sequential_anomaly_repo(1),
        zscore_registry(),
        PipelineConfig::default(),
    );

    let summary = h
        .pipeline
        .ingest_http_batch("dev-1", vec![measurement(40.0)])
        .await
        .unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.anomalies, 1);
}

#[tokio::test]
async fn test_location_update_publishes_device_event() {
    let mut devices = provisioning_device_repo();
    devices.expect_update_location().returning(|device_id, lat, lng| {
        let mut device = test_device(device_id);
        device.lat = Some(lat);
        device.lng = Some(lng);
        Ok(device)
    });

    let h = harness(
        devices,
        sequential_point_repo(),
        sequential_anomaly_repo(1),
        zscore_registry(),
        PipelineConfig::default(),
    );
    let mut firehose = h.bus.subscribe_firehose();

    h.pipeline
        .update_device_location("dev42", 37.3, -121.9)
        .await
        .unwrap();

    match firehose.recv().await.unwrap() {
        BusEvent::DeviceUpdate { device_id, device } => {
            assert_eq!(device_id, "dev42");
            assert_eq!(device.location_label().unwrap(), "lat:37.3,lng:-121.9");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_external_buffer_is_flushed_through_fallback_on_shutdown() {
    let mut rpc = MockScoreRpc::new();
    // Below the dispatch threshold the scorer is never called.
    rpc.expect_score_batch().times(0);
    let registry = Arc::new(DetectorRegistry::with_rpc(
        RegistryConfig {
            engine: DetectorKind::External,
            external_batch_size: 64,
            ..Default::default()
        },
        Arc::new(rpc),
    ));

    let h = harness(
        provisioning_device_repo(),
        sequential_point_repo(),
        sequential_anomaly_repo(500),
        registry,
        PipelineConfig::default(),
    );
    let mut firehose = h.bus.subscribe_firehose();

    let mut batch: Vec<RawMeasurement> = (0..29).map(|_| measurement(22.0)).collect();
    batch.push(measurement(100.0));
    let summary = h.pipeline.ingest_http_batch("dev-1", batch).await.unwrap();
    // Everything is buffered inside the external detector, nothing scored yet.
    assert_eq!(summary.inserted, 30);
    assert_eq!(summary.anomalies, 0);

    h.pipeline.shutdown().await;

    let mut metrics = 0;
    let mut anomalies = Vec::new();
    while let Ok(event) = firehose.try_recv() {
        match event {
            BusEvent::MetricNew { .. } => metrics += 1,
            BusEvent::AnomalyNew { anomaly, .. } => anomalies.push(anomaly),
            BusEvent::DeviceUpdate { .. } => {}
        }
    }
    assert_eq!(metrics, 30);
    // The flush scored the buffer locally and tagged the spike with the
    // detector that actually ran.
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].detector, DetectorKind::ZScore);
    assert_eq!(anomalies[0].id, Some(500));
}
