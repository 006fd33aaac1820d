use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use vigil_domain::{DetectorKind, StoreStats};

#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StoreStats>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub database: DatabaseHealth,
    #[serde(rename = "anomalyEngine")]
    pub anomaly_engine: DetectorKind,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected = state.store.connected().await;
    let stats = if connected {
        state.store.stats().await.ok()
    } else {
        None
    };

    Json(HealthResponse {
        status: if connected { "ok" } else { "degraded" },
        timestamp: Utc::now(),
        database: DatabaseHealth { connected, stats },
        anomaly_engine: state.engine,
    })
}
