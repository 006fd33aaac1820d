use crate::client::{with_retries, PostgresClient, DEFAULT_WRITE_ATTEMPTS};
use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, instrument};
use vigil_domain::{DomainError, DomainResult, Point, PointQuery, PointRepository};

const POINT_COLUMNS: &str =
    "id, device_id, ts, temperature_c, vibration_g, humidity_pct, voltage_v";

fn point_from_row(row: &Row) -> Point {
    Point {
        id: Some(row.get(0)),
        device_id: row.get(1),
        ts: row.get(2),
        temperature_c: row.get(3),
        vibration_g: row.get(4),
        humidity_pct: row.get(5),
        voltage_v: row.get(6),
    }
}

/// WHERE clause and parameter list shared by the list and count queries.
fn point_filters<'a>(query: &'a PointQuery) -> (String, Vec<&'a (dyn ToSql + Sync)>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
    if let Some(device_id) = &query.device_id {
        params.push(device_id);
        conditions.push(format!("device_id = ${}", params.len()));
    }
    if let Some(from) = &query.from {
        params.push(from);
        conditions.push(format!("ts >= ${}", params.len()));
    }
    if let Some(to) = &query.to {
        params.push(to);
        conditions.push(format!("ts <= ${}", params.len()));
    }
    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (clause, params)
}

/// PostgreSQL implementation of the PointRepository trait.
#[derive(Clone)]
pub struct PostgresPointRepository {
    client: PostgresClient,
}

impl PostgresPointRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PointRepository for PostgresPointRepository {
    #[instrument(skip(self, points), fields(batch = points.len()))]
    async fn insert_points(&self, points: &[Point]) -> DomainResult<Vec<i64>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        // One multi-row INSERT: atomic, and RETURNING preserves input order.
        let placeholders: Vec<String> = (0..points.len())
            .map(|i| {
                let base = i * 6;
                format!(
                    "(${}, ${}, ${}, ${}, ${}, ${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5,
                    base + 6
                )
            })
            .collect();
        let query = format!(
            "INSERT INTO points (device_id, ts, temperature_c, vibration_g, humidity_pct, voltage_v)
             VALUES {} RETURNING id",
            placeholders.join(", ")
        );

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(points.len() * 6);
        for point in points {
            params.push(&point.device_id);
            params.push(&point.ts);
            params.push(&point.temperature_c);
            params.push(&point.vibration_g);
            params.push(&point.humidity_pct);
            params.push(&point.voltage_v);
        }

        let client = &self.client;
        let query = query.as_str();
        let params = params.as_slice();
        let rows = with_retries("insert_points", DEFAULT_WRITE_ATTEMPTS, || async move {
            let conn = client.get_connection().await?;
            Ok(conn.query(query, params).await?)
        })
        .await?;

        debug!("inserted {} points", rows.len());
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    #[instrument(skip(self, query))]
    async fn list_points(&self, query: PointQuery) -> DomainResult<Vec<Point>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let (clause, mut params) = point_filters(&query);
        params.push(&query.limit);
        let limit_idx = params.len();
        params.push(&query.offset);
        let offset_idx = params.len();

        let sql = format!(
            "SELECT {POINT_COLUMNS} FROM points{clause}
             ORDER BY ts DESC LIMIT ${limit_idx} OFFSET ${offset_idx}"
        );
        let rows = conn
            .query(sql.as_str(), &params)
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows.iter().map(point_from_row).collect())
    }

    #[instrument(skip(self, query))]
    async fn count_points(&self, query: PointQuery) -> DomainResult<i64> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let (clause, params) = point_filters(&query);
        let sql = format!("SELECT COUNT(*) FROM points{clause}");
        let row = conn
            .query_one(sql.as_str(), &params)
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.get(0))
    }
}
