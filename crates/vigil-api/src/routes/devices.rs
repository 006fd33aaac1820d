use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_domain::{CreateDeviceInput, Device, DeviceWithCounts};

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceWithCounts>,
    pub count: usize,
}

pub async fn list_devices(
    State(state): State<AppState>,
) -> Result<Json<DeviceListResponse>, ApiError> {
    let devices = state.devices.list_devices().await?;
    let count = devices.len();
    Ok(Json(DeviceListResponse { devices, count }))
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let device = state
        .devices
        .get_device(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("device {}", id)))?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
}

pub async fn create_device(
    State(state): State<AppState>,
    Json(request): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    let device = state
        .devices
        .create_device(CreateDeviceInput {
            device_id: Uuid::new_v4().to_string(),
            name: request.name,
            location: request.location,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}
