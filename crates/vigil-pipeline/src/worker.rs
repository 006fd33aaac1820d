use crate::pipeline::IngestSummary;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_bus::EventBus;
use vigil_domain::{
    Anomaly, AnomalyRepository, BusEvent, Detector, DetectorFactory, DomainResult, Point,
    PointQuery, PointRepository, Scored,
};

/// One unit of work for a device worker: an ordered batch of normalised
/// points, with an optional reply channel for the synchronous edge.
pub(crate) struct Job {
    points: Vec<Point>,
    reply: Option<oneshot::Sender<DomainResult<IngestSummary>>>,
}

impl Job {
    pub(crate) fn new(
        points: Vec<Point>,
        reply: Option<oneshot::Sender<DomainResult<IngestSummary>>>,
    ) -> Self {
        Self { points, reply }
    }
}

/// Dependencies shared by every device worker.
pub(crate) struct WorkerShared {
    pub(crate) points: Arc<dyn PointRepository>,
    pub(crate) anomalies: Arc<dyn AnomalyRepository>,
    pub(crate) detectors: Arc<dyn DetectorFactory>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) dropped_batches: AtomicU64,
}

impl WorkerShared {
    pub(crate) fn new(
        points: Arc<dyn PointRepository>,
        anomalies: Arc<dyn AnomalyRepository>,
        detectors: Arc<dyn DetectorFactory>,
        bus: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            points,
            anomalies,
            detectors,
            bus,
            shutdown,
            dropped_batches: AtomicU64::new(0),
        }
    }
}

/// Serialisation loop for one device.
///
/// Jobs are handled strictly in arrival order: persist, publish `metric:new`
/// per point, score, persist anomalies, publish `anomaly:new`. The worker
/// exits when its queue closes, on shutdown (after draining), or after the
/// idle timeout; any detector-buffered points are flushed on the way out.
pub(crate) async fn run_device_worker(
    shared: Arc<WorkerShared>,
    device_id: String,
    mut jobs: mpsc::Receiver<Job>,
    idle_timeout: Duration,
) {
    let mut detector = shared.detectors.create(&device_id);
    warm_detector(&shared, &device_id, detector.as_mut()).await;

    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => process_job(&shared, &device_id, detector.as_mut(), job).await,
                None => break,
            },
            _ = shared.shutdown.cancelled() => {
                while let Ok(job) = jobs.try_recv() {
                    process_job(&shared, &device_id, detector.as_mut(), job).await;
                }
                break;
            }
            _ = tokio::time::sleep(idle_timeout) => {
                debug!(device_id = %device_id, "reaping idle device worker");
                break;
            }
        }
    }

    let flushed = detector.flush().await;
    if !flushed.is_empty() {
        commit_scored(&shared, &device_id, &flushed).await;
    }
    debug!(device_id = %device_id, "device worker stopped");
}

/// Rebuild the detector window from the most recent persisted points, so a
/// device picks up where it left off after a restart or an idle reap. A
/// failed read just means a cold start.
async fn warm_detector(shared: &WorkerShared, device_id: &str, detector: &mut dyn Detector) {
    let capacity = detector.window_capacity();
    if capacity == 0 {
        return;
    }

    let query = PointQuery {
        device_id: Some(device_id.to_string()),
        limit: capacity as i64,
        ..Default::default()
    };
    match shared.points.list_points(query).await {
        Ok(mut history) if !history.is_empty() => {
            // The store returns newest first; windows fill oldest first.
            history.reverse();
            detector.warm(&history);
            debug!(
                device_id = %device_id,
                points = history.len(),
                "warmed detector window from store"
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(
                device_id = %device_id,
                error = %e,
                "window warm-up failed, starting cold"
            );
        }
    }
}

async fn process_job(
    shared: &WorkerShared,
    device_id: &str,
    detector: &mut dyn Detector,
    job: Job,
) {
    let Job { mut points, reply } = job;

    let ids = match shared.points.insert_points(&points).await {
        Ok(ids) => ids,
        Err(e) => {
            match reply {
                Some(reply) => {
                    let _ = reply.send(Err(e));
                }
                None => {
                    shared
                        .dropped_batches
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!(
                        device_id = %device_id,
                        points = points.len(),
                        error = %e,
                        "dropping batch after persistence failure"
                    );
                }
            }
            return;
        }
    };
    for (point, id) in points.iter_mut().zip(ids) {
        point.id = Some(id);
    }

    // Persistence is committed; fan the points out in arrival order before
    // scoring so subscribers never wait on a detector.
    for point in &points {
        shared.bus.publish(BusEvent::MetricNew {
            device_id: device_id.to_string(),
            metric: point.clone(),
        });
    }

    let scored = detector.score_batch(&points).await;
    let anomalies = commit_scored(shared, device_id, &scored).await;

    if let Some(reply) = reply {
        let _ = reply.send(Ok(IngestSummary {
            inserted: points.len(),
            anomalies,
        }));
    }
}

/// Persist anomaly records for flagged results, then publish `anomaly:new`
/// carrying the persisted ids. Events are suppressed when the insert fails.
/// Returns the number of anomalies detected.
async fn commit_scored(shared: &WorkerShared, device_id: &str, scored: &[Scored]) -> usize {
    let mut records: Vec<Anomaly> = scored
        .iter()
        .filter(|s| s.is_anomaly)
        .map(|s| Anomaly {
            id: None,
            device_id: device_id.to_string(),
            point_id: s.point.id,
            ts: s.point.ts,
            score: s.score,
            detector: s.detector,
            flagged: true,
        })
        .collect();
    if records.is_empty() {
        return 0;
    }
    let detected = records.len();

    match shared.anomalies.insert_anomalies(&records).await {
        Ok(persisted) => {
            if persisted.len() != records.len() {
                warn!(
                    device_id = %device_id,
                    detected,
                    persisted = persisted.len(),
                    "some anomaly rows were skipped as duplicates"
                );
            }
            // Pairs come back ordered by batch index, so events keep the
            // per-device arrival order; skipped rows publish nothing.
            for (index, id) in persisted {
                let Some(record) = records.get_mut(index) else {
                    warn!(device_id = %device_id, index, "ignoring id for unknown batch index");
                    continue;
                };
                record.id = Some(id);
                shared.bus.publish(BusEvent::AnomalyNew {
                    device_id: device_id.to_string(),
                    anomaly: record.clone(),
                });
            }
        }
        Err(e) => {
            warn!(
                device_id = %device_id,
                detected,
                error = %e,
                "anomaly insert failed, events suppressed"
            );
        }
    }
    detected
}
