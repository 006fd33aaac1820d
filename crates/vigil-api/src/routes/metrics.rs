use super::{clamp_page, default_limit, Pagination};
use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_domain::{Point, PointQuery};

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub metrics: Vec<Point>,
    pub pagination: Pagination,
}

pub async fn list_metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricsParams>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let (limit, offset) = clamp_page(params.limit, params.offset);
    let query = PointQuery {
        device_id: params.device_id,
        from: params.from,
        to: params.to,
        limit,
        offset,
    };

    let total = state.points.count_points(query.clone()).await?;
    let metrics = state.points.list_points(query).await?;

    Ok(Json(MetricsResponse {
        metrics,
        pagination: Pagination {
            total,
            limit,
            offset,
        },
    }))
}
