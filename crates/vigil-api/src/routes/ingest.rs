use crate::error::ApiError;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::debug;
use vigil_pipeline::RawMeasurement;

/// Header carrying the shared ingest secret.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub metrics: Vec<RawMeasurement>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(rename = "metricsInserted")]
    pub metrics_inserted: usize,
    #[serde(rename = "anomaliesDetected")]
    pub anomalies_detected: usize,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

pub async fn ingest(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if let Some(expected) = &state.api_key {
        if presented != Some(expected.as_str()) {
            debug!("missing or invalid ingest api key");
            return Err(ApiError::Unauthorized);
        }
    }

    // Rate limit per client identity: the presented key, else the peer IP.
    let identity = presented
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string());
    if !state.rate_limiter.try_acquire(&identity) {
        return Err(ApiError::RateLimited);
    }

    // Parse by hand so any schema violation is a 400, not a 422.
    let request: IngestRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid ingest body: {}", e)))?;
    if request.metrics.is_empty() {
        return Err(ApiError::BadRequest(
            "metrics must contain at least one point".to_string(),
        ));
    }

    let summary = state
        .pipeline
        .ingest_http_batch(&request.device_id, request.metrics)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            success: true,
            metrics_inserted: summary.inserted,
            anomalies_detected: summary.anomalies,
            device_id: request.device_id,
        }),
    ))
}
