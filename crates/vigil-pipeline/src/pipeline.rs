use crate::worker::{run_device_worker, Job, WorkerShared};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use vigil_bus::EventBus;
use vigil_domain::{
    BusEvent, DetectorFactory, DeviceRepository, DomainError, DomainResult, Point,
    UpsertDeviceInput,
};

/// A measurement as it arrives at an edge, before normalisation.
///
/// The timestamp is optional; the pipeline assigns the accept time when the
/// client did not supply one.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMeasurement {
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    pub temperature_c: f64,
    pub vibration_g: f64,
    pub humidity_pct: f64,
    pub voltage_v: f64,
}

/// Outcome of a synchronous (HTTP) ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub anomalies: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Create devices on first contact instead of rejecting unknown ids.
    pub auto_provision: bool,
    /// Reap a device worker after this long without a job.
    pub worker_idle_timeout: Duration,
    /// Bound on each device's job queue; senders wait when it is full.
    pub job_queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_provision: true,
            worker_idle_timeout: Duration::from_secs(300),
            job_queue_depth: 32,
        }
    }
}

/// Central ingest state machine.
///
/// Every accepted point is resolved, normalised, and handed to a per-device
/// worker that persists, scores, and publishes in arrival order. Workers are
/// spawned lazily and reaped when idle; devices never block each other.
pub struct IngestionPipeline {
    shared: Arc<WorkerShared>,
    config: PipelineConfig,
    devices: Arc<dyn DeviceRepository>,
    known_devices: RwLock<HashSet<String>>,
    workers: Mutex<HashMap<String, mpsc::Sender<Job>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl IngestionPipeline {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        points: Arc<dyn vigil_domain::PointRepository>,
        anomalies: Arc<dyn vigil_domain::AnomalyRepository>,
        detectors: Arc<dyn DetectorFactory>,
        bus: Arc<EventBus>,
        config: PipelineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared::new(
                points,
                anomalies,
                detectors,
                bus,
                shutdown.clone(),
            )),
            config,
            devices,
            known_devices: RwLock::new(HashSet::new()),
            workers: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Ingest an HTTP batch: blocks until the batch is persisted and scored,
    /// and fails the whole batch on the first invalid point.
    #[instrument(skip(self, metrics), fields(device_id = %device_id, batch = metrics.len()))]
    pub async fn ingest_http_batch(
        &self,
        device_id: &str,
        metrics: Vec<RawMeasurement>,
    ) -> DomainResult<IngestSummary> {
        if self.shutdown.is_cancelled() {
            return Err(DomainError::ShuttingDown);
        }
        self.resolve_device(device_id).await?;

        let mut points = Vec::with_capacity(metrics.len());
        for raw in &metrics {
            points.push(normalise(device_id, raw)?);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(device_id, Job::new(points, Some(reply_tx)))
            .await?;
        reply_rx.await.map_err(|_| DomainError::ShuttingDown)?
    }

    /// Ingest a buffered batch from a best-effort edge (MQTT): enqueue and
    /// return. Invalid points are dropped individually with a warning; store
    /// failures are absorbed by the worker and counted.
    #[instrument(skip(self, metrics), fields(device_id = %device_id, batch = metrics.len()))]
    pub async fn ingest_buffered(
        &self,
        device_id: &str,
        metrics: Vec<RawMeasurement>,
    ) -> DomainResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(DomainError::ShuttingDown);
        }
        self.resolve_device(device_id).await?;

        let mut points = Vec::with_capacity(metrics.len());
        for raw in &metrics {
            match normalise(device_id, raw) {
                Ok(point) => points.push(point),
                Err(e) => warn!(device_id = %device_id, error = %e, "dropping invalid point"),
            }
        }
        if points.is_empty() {
            return Ok(());
        }
        self.submit(device_id, Job::new(points, None)).await
    }

    /// Record device coordinates and fan out a `device:update` event.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn update_device_location(
        &self,
        device_id: &str,
        lat: f64,
        lng: f64,
    ) -> DomainResult<()> {
        self.resolve_device(device_id).await?;
        let device = self.devices.update_location(device_id, lat, lng).await?;
        self.shared.bus.publish(BusEvent::DeviceUpdate {
            device_id: device_id.to_string(),
            device,
        });
        Ok(())
    }

    /// Batches dropped after a persistence failure on the best-effort path.
    pub fn dropped_batches(&self) -> u64 {
        self.shared.dropped_batches.load(Ordering::Relaxed)
    }

    /// Signal shutdown and wait for every device worker to drain its queue
    /// and flush its detector. The caller bounds this with a grace period.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("ingestion pipeline drained");
    }

    /// Look the device up once, creating it when auto-provisioning allows.
    async fn resolve_device(&self, device_id: &str) -> DomainResult<()> {
        if device_id.trim().is_empty() {
            return Err(DomainError::InvalidDeviceId(device_id.to_string()));
        }
        if self
            .known_devices
            .read()
            .expect("device cache poisoned")
            .contains(device_id)
        {
            return Ok(());
        }

        if self.config.auto_provision {
            self.devices
                .upsert_device(UpsertDeviceInput {
                    device_id: device_id.to_string(),
                    name: device_id.to_string(),
                })
                .await?;
            debug!(device_id = %device_id, "device provisioned on first contact");
        } else {
            self.devices
                .get_device(device_id)
                .await?
                .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;
        }

        self.known_devices
            .write()
            .expect("device cache poisoned")
            .insert(device_id.to_string());
        Ok(())
    }

    /// Hand a job to the device's worker, spawning or respawning it as
    /// needed. A full queue applies backpressure to the caller.
    async fn submit(&self, device_id: &str, job: Job) -> DomainResult<()> {
        let mut job = job;
        loop {
            let sender = self.worker_sender(device_id).await;
            match sender.send(job).await {
                Ok(()) => return Ok(()),
                // The worker was reaped between lookup and send; retry with
                // a fresh one.
                Err(mpsc::error::SendError(returned)) => {
                    if self.shutdown.is_cancelled() {
                        return Err(DomainError::ShuttingDown);
                    }
                    job = returned;
                }
            }
        }
    }

    async fn worker_sender(&self, device_id: &str) -> mpsc::Sender<Job> {
        let mut workers = self.workers.lock().await;
        if let Some(sender) = workers.get(device_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.config.job_queue_depth);
        let shared = Arc::clone(&self.shared);
        let id = device_id.to_string();
        let idle_timeout = self.config.worker_idle_timeout;
        self.tracker
            .spawn(run_device_worker(shared, id, rx, idle_timeout));
        workers.insert(device_id.to_string(), tx.clone());
        debug!(device_id = %device_id, "spawned device worker");
        tx
    }

    /// Number of live device workers (test and health visibility).
    pub async fn active_workers(&self) -> usize {
        let workers = self.workers.lock().await;
        workers.values().filter(|tx| !tx.is_closed()).count()
    }
}

fn normalise(device_id: &str, raw: &RawMeasurement) -> DomainResult<Point> {
    let point = Point {
        id: None,
        device_id: device_id.to_string(),
        ts: raw.ts.unwrap_or_else(Utc::now),
        temperature_c: raw.temperature_c,
        vibration_g: raw.vibration_g,
        humidity_pct: raw.humidity_pct,
        voltage_v: raw.voltage_v,
    };
    if !point.is_finite() {
        return Err(DomainError::InvalidPoint(format!(
            "non-finite measurement for device {}",
            device_id
        )));
    }
    Ok(point)
}
