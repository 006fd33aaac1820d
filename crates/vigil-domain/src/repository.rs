use crate::error::DomainResult;
use crate::types::{Anomaly, Device, DeviceWithCounts, DetectorKind, Point};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Input for the first-contact upsert used by auto-provisioning.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertDeviceInput {
    pub device_id: String,
    pub name: String,
}

/// Input for explicit device creation through the API.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateDeviceInput {
    pub device_id: String,
    pub name: String,
    pub location: Option<String>,
}

/// Range query over persisted points.
#[derive(Debug, Clone)]
pub struct PointQuery {
    pub device_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for PointQuery {
    fn default() -> Self {
        Self {
            device_id: None,
            from: None,
            to: None,
            limit: 1000,
            offset: 0,
        }
    }
}

/// Range query over persisted anomalies.
#[derive(Debug, Clone)]
pub struct AnomalyQuery {
    pub device_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub detector: Option<DetectorKind>,
    pub flagged: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for AnomalyQuery {
    fn default() -> Self {
        Self {
            device_id: None,
            from: None,
            to: None,
            detector: None,
            flagged: None,
            limit: 1000,
            offset: 0,
        }
    }
}

/// Row totals surfaced by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub devices: i64,
    pub metrics: i64,
    pub anomalies: i64,
}

/// Connectivity and row totals for the health endpoint.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn connected(&self) -> bool;

    async fn stats(&self) -> DomainResult<StoreStats>;
}

/// Repository trait for device storage operations.
/// Infrastructure layer (vigil-postgres) implements this trait.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Idempotent create-or-keep for first-contact provisioning.
    async fn upsert_device(&self, input: UpsertDeviceInput) -> DomainResult<Device>;

    /// Explicit creation; fails with `DeviceAlreadyExists` on duplicate.
    async fn create_device(&self, input: CreateDeviceInput) -> DomainResult<Device>;

    /// Record reported coordinates for a device.
    async fn update_location(&self, device_id: &str, lat: f64, lng: f64) -> DomainResult<Device>;

    async fn get_device(&self, device_id: &str) -> DomainResult<Option<Device>>;

    async fn list_devices(&self) -> DomainResult<Vec<DeviceWithCounts>>;
}

/// Repository trait for point storage operations.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait PointRepository: Send + Sync {
    /// All-or-nothing batch insert; returns persisted ids in input order.
    async fn insert_points(&self, points: &[Point]) -> DomainResult<Vec<i64>>;

    async fn list_points(&self, query: PointQuery) -> DomainResult<Vec<Point>>;

    async fn count_points(&self, query: PointQuery) -> DomainResult<i64>;
}

/// Repository trait for anomaly storage operations.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait AnomalyRepository: Send + Sync {
    /// Best-effort batch insert; rows that duplicate an existing anomaly are
    /// skipped. Returns `(batch index, persisted id)` pairs for the rows
    /// that landed, ordered by batch index, so callers can re-associate ids
    /// even when some rows were skipped.
    async fn insert_anomalies(&self, anomalies: &[Anomaly]) -> DomainResult<Vec<(usize, i64)>>;

    async fn list_anomalies(&self, query: AnomalyQuery) -> DomainResult<Vec<Anomaly>>;

    async fn count_anomalies(&self, query: AnomalyQuery) -> DomainResult<i64>;
}
