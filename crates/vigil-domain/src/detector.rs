use crate::types::{DetectorKind, Point};
use async_trait::async_trait;

/// A point paired with its scoring outcome.
///
/// `detector` records the variant that actually produced the score, which
/// may be the fallback rather than the configured engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub point: Point,
    pub score: f64,
    pub is_anomaly: bool,
    pub detector: DetectorKind,
}

/// A detector owns the sliding window for a single device and scores ordered
/// batches of points.
///
/// Implementations are exclusively mutated by that device's pipeline worker,
/// so no internal synchronisation is required. Results may cover points from
/// earlier calls (the external scorer buffers until its batch threshold), but
/// every accepted point appears in exactly one result, in arrival order.
#[async_trait]
pub trait Detector: Send {
    fn kind(&self) -> DetectorKind;

    /// How many historical points the detector wants for window
    /// reconstruction when its device worker spawns.
    fn window_capacity(&self) -> usize {
        0
    }

    /// Rebuild the sliding window from already-scored history, oldest first.
    /// Must not produce scores: these points were scored when they arrived.
    fn warm(&mut self, _history: &[Point]) {}

    /// Score a batch of points in arrival order. Points must already carry
    /// their persisted ids.
    async fn score_batch(&mut self, points: &[Point]) -> Vec<Scored>;

    /// Drain any internally buffered points, scoring them with whatever the
    /// detector can still do locally. Called on shutdown.
    async fn flush(&mut self) -> Vec<Scored> {
        Vec::new()
    }
}

/// Builds one detector per device worker.
///
/// Detectors share no mutable state; the factory only carries configuration
/// and long-lived clients (e.g. the external scorer's HTTP client).
pub trait DetectorFactory: Send + Sync {
    fn create(&self, device_id: &str) -> Box<dyn Detector>;

    /// The configured engine, surfaced by the health endpoint.
    fn engine(&self) -> DetectorKind;
}
