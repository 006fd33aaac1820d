//! API route definitions.

mod anomalies;
mod devices;
mod health;
mod ingest;
mod metrics;

use crate::state::AppState;
use crate::ws;
use axum::routing::{get, post};
use axum::Router;

/// Build the complete API router.
///
/// - `POST /api/ingest` — batch ingest (auth + rate limit)
/// - `GET /api/devices`, `GET /api/devices/{id}`, `POST /api/devices`
/// - `GET /api/metrics` — paged range query
/// - `GET /api/anomalies` — paged range query with detector/flagged filters
/// - `GET /api/health`
/// - `GET /ws` — dashboard subscription socket
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest::ingest))
        .route(
            "/api/devices",
            get(devices::list_devices).post(devices::create_device),
        )
        .route("/api/devices/{id}", get(devices::get_device))
        .route("/api/metrics", get(metrics::list_metrics))
        .route("/api/anomalies", get(anomalies::list_anomalies))
        .route("/api/health", get(health::health))
        .route("/ws", get(ws::upgrade))
        .with_state(state)
}

/// Pagination envelope shared by the range queries.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub(crate) struct Pagination {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub(crate) fn default_limit() -> i64 {
    1000
}

pub(crate) fn clamp_page(limit: i64, offset: i64) -> (i64, i64) {
    (limit.clamp(1, 10_000), offset.max(0))
}
