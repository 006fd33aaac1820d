use crate::rate_limit::RateLimiter;
use std::sync::Arc;
use vigil_bus::EventBus;
use vigil_domain::{
    AnomalyRepository, DetectorKind, DeviceRepository, PointRepository, StoreHealth,
};
use vigil_pipeline::IngestionPipeline;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    pub devices: Arc<dyn DeviceRepository>,
    pub points: Arc<dyn PointRepository>,
    pub anomalies: Arc<dyn AnomalyRepository>,
    pub store: Arc<dyn StoreHealth>,
    pub bus: Arc<EventBus>,
    pub engine: DetectorKind,
    /// Shared secret for the ingest path; `None` leaves ingest open.
    pub api_key: Option<String>,
    pub rate_limiter: Arc<RateLimiter>,
}
