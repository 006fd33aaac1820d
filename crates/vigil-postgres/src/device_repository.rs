use crate::client::{with_retries, PostgresClient, DEFAULT_WRITE_ATTEMPTS};
use async_trait::async_trait;
use chrono::Utc;
use tokio_postgres::Row;
use tracing::{debug, instrument};
use vigil_domain::{
    CreateDeviceInput, Device, DeviceRepository, DeviceWithCounts, DomainError, DomainResult,
    EntityCounts, UpsertDeviceInput,
};

const DEVICE_COLUMNS: &str = "device_id, device_name, location, lat, lng, created_at, updated_at";

fn device_from_row(row: &Row) -> Device {
    Device {
        device_id: row.get(0),
        name: row.get(1),
        location: row.get(2),
        lat: row.get(3),
        lng: row.get(4),
        created_at: Some(row.get(5)),
        updated_at: Some(row.get(6)),
    }
}

/// Split a free-text location into columns: the canonical
/// `lat:<lat>,lng:<lng>` form lands in the numeric columns, anything else is
/// kept verbatim.
fn split_location(text: &str) -> (Option<String>, Option<f64>, Option<f64>) {
    let parse = || {
        let (lat_part, lng_part) = text.split_once(',')?;
        let lat = lat_part.trim().strip_prefix("lat:")?.trim().parse().ok()?;
        let lng = lng_part.trim().strip_prefix("lng:")?.trim().parse().ok()?;
        Some((lat, lng))
    };
    match parse() {
        Some((lat, lng)) => (None, Some(lat), Some(lng)),
        None => (Some(text.to_string()), None, None),
    }
}

/// PostgreSQL implementation of the DeviceRepository trait.
#[derive(Clone)]
pub struct PostgresDeviceRepository {
    client: PostgresClient,
}

impl PostgresDeviceRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    #[instrument(skip(self, input), fields(device_id = %input.device_id))]
    async fn upsert_device(&self, input: UpsertDeviceInput) -> DomainResult<Device> {
        let client = &self.client;
        let input = &input;
        let row = with_retries("upsert_device", DEFAULT_WRITE_ATTEMPTS, || async move {
            let conn = client.get_connection().await?;
            let now = Utc::now();
            let query = format!(
                "INSERT INTO devices (device_id, device_name, created_at, updated_at)
                 VALUES ($1, $2, $3, $3)
                 ON CONFLICT (device_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
                 RETURNING {DEVICE_COLUMNS}"
            );
            let row = conn
                .query_one(query.as_str(), &[&input.device_id, &input.name, &now])
                .await?;
            Ok(row)
        })
        .await?;

        debug!("device upserted: {}", input.device_id);
        Ok(device_from_row(&row))
    }

    #[instrument(skip(self, input), fields(device_id = %input.device_id))]
    async fn create_device(&self, input: CreateDeviceInput) -> DomainResult<Device> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let (location, lat, lng) = match &input.location {
            Some(text) => split_location(text),
            None => (None, None, None),
        };
        let now = Utc::now();

        let query = format!(
            "INSERT INTO devices (device_id, device_name, location, lat, lng, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             RETURNING {DEVICE_COLUMNS}"
        );
        let result = conn
            .query_one(
                query.as_str(),
                &[&input.device_id, &input.name, &location, &lat, &lng, &now],
            )
            .await;

        match result {
            Ok(row) => {
                debug!("device created: {}", input.device_id);
                Ok(device_from_row(&row))
            }
            Err(e) => {
                // PostgreSQL error code 23505 is unique_violation
                if let Some(db_err) = e.as_db_error() {
                    if db_err.code().code() == "23505" {
                        return Err(DomainError::DeviceAlreadyExists(input.device_id));
                    }
                }
                Err(DomainError::RepositoryError(e.into()))
            }
        }
    }

    #[instrument(skip(self))]
    async fn update_location(&self, device_id: &str, lat: f64, lng: f64) -> DomainResult<Device> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let query = format!(
            "UPDATE devices SET lat = $2, lng = $3, updated_at = $4
             WHERE device_id = $1
             RETURNING {DEVICE_COLUMNS}"
        );
        let row = conn
            .query_opt(query.as_str(), &[&device_id, &lat, &lng, &Utc::now()])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        match row {
            Some(row) => Ok(device_from_row(&row)),
            None => Err(DomainError::DeviceNotFound(device_id.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn get_device(&self, device_id: &str) -> DomainResult<Option<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let query = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = $1");
        let row = conn
            .query_opt(query.as_str(), &[&device_id])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.as_ref().map(device_from_row))
    }

    #[instrument(skip(self))]
    async fn list_devices(&self) -> DomainResult<Vec<DeviceWithCounts>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                "SELECT d.device_id, d.device_name, d.location, d.lat, d.lng,
                        d.created_at, d.updated_at,
                        (SELECT COUNT(*) FROM points p WHERE p.device_id = d.device_id),
                        (SELECT COUNT(*) FROM anomalies a WHERE a.device_id = d.device_id)
                 FROM devices d
                 ORDER BY d.created_at DESC",
                &[],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let devices = rows
            .iter()
            .map(|row| DeviceWithCounts {
                device: device_from_row(row),
                counts: EntityCounts {
                    metrics: row.get(7),
                    anomalies: row.get(8),
                },
            })
            .collect();

        debug!("listed {} devices", rows.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_location_canonical_form() {
        let (text, lat, lng) = split_location("lat:37.3,lng:-121.9");
        assert_eq!(text, None);
        assert_eq!(lat, Some(37.3));
        assert_eq!(lng, Some(-121.9));
    }

    #[test]
    fn test_split_location_with_spaces() {
        let (text, lat, lng) = split_location("lat: 10.5 , lng: 20.25");
        assert_eq!(text, None);
        assert_eq!(lat, Some(10.5));
        assert_eq!(lng, Some(20.25));
    }

    #[test]
    fn test_split_location_free_text() {
        let (text, lat, lng) = split_location("warehouse 4, row 2");
        assert_eq!(text.as_deref(), Some("warehouse 4, row 2"));
        assert_eq!(lat, None);
        assert_eq!(lng, None);
    }

    #[test]
    fn test_split_location_malformed_coordinates_kept_as_text() {
        let (text, lat, lng) = split_location("lat:abc,lng:1.0");
        assert!(text.is_some());
        assert_eq!(lat, None);
        assert_eq!(lng, None);
    }
}
