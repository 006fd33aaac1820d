use super::{clamp_page, default_limit, Pagination};
use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_domain::{Anomaly, AnomalyQuery, DetectorKind};

#[derive(Debug, Deserialize)]
pub struct AnomalyParams {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub detector: Option<DetectorKind>,
    pub flagged: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct AnomaliesResponse {
    pub anomalies: Vec<Anomaly>,
    pub pagination: Pagination,
}

pub async fn list_anomalies(
    State(state): State<AppState>,
    Query(params): Query<AnomalyParams>,
) -> Result<Json<AnomaliesResponse>, ApiError> {
    let (limit, offset) = clamp_page(params.limit, params.offset);
    let query = AnomalyQuery {
        device_id: params.device_id,
        from: params.from,
        to: params.to,
        detector: params.detector,
        flagged: params.flagged,
        limit,
        offset,
    };

    let total = state.anomalies.count_anomalies(query.clone()).await?;
    let anomalies = state.anomalies.list_anomalies(query).await?;

    Ok(Json(AnomaliesResponse {
        anomalies,
        pagination: Pagination {
            total,
            limit,
            offset,
        },
    }))
}
