use crate::client::{with_retries, PostgresClient, DEFAULT_WRITE_ATTEMPTS};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, instrument};
use vigil_domain::{
    Anomaly, AnomalyQuery, AnomalyRepository, DetectorKind, DomainError, DomainResult,
};

const ANOMALY_COLUMNS: &str = "id, device_id, point_id, ts, score, detector, flagged";

fn anomaly_from_row(row: &Row) -> DomainResult<Anomaly> {
    let detector: String = row.get(5);
    let detector = DetectorKind::parse(&detector)
        .ok_or_else(|| anyhow::anyhow!("unknown detector tag in store: {detector}"))?;
    Ok(Anomaly {
        id: Some(row.get(0)),
        device_id: row.get(1),
        point_id: row.get(2),
        ts: row.get(3),
        score: row.get(4),
        detector,
        flagged: row.get(6),
    })
}

fn anomaly_filters<'a>(
    query: &'a AnomalyQuery,
    detector: &'a Option<String>,
) -> (String, Vec<&'a (dyn ToSql + Sync)>) {
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
    if let Some(tag) = detector {
        params.push(tag);
        conditions.push(format!("detector = ${}", params.len()));
    }
    if let Some(flagged) = &query.flagged {
        params.push(flagged);
        conditions.push(format!("flagged = ${}", params.len()));
    }
    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (clause, params)
}

/// PostgreSQL implementation of the AnomalyRepository trait.
#[derive(Clone)]
pub struct PostgresAnomalyRepository {
    client: PostgresClient,
}

impl PostgresAnomalyRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnomalyRepository for PostgresAnomalyRepository {
    #[instrument(skip(self, anomalies), fields(batch = anomalies.len()))]
    async fn insert_anomalies(&self, anomalies: &[Anomaly]) -> DomainResult<Vec<(usize, i64)>> {
        if anomalies.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<String> = (0..anomalies.len())
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
        // RETURNING echoes the dedupe key so skipped rows can be told apart
        // from inserted ones by content; RETURNING order is not positional.
        let query = format!(
            "INSERT INTO anomalies (device_id, point_id, ts, score, detector, flagged)
             VALUES {}
             ON CONFLICT (device_id, point_id, detector) DO NOTHING
             RETURNING id, device_id, point_id, detector",
            placeholders.join(", ")
        );

        let tags: Vec<String> = anomalies
            .iter()
            .map(|a| a.detector.as_str().to_string())
            .collect();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(anomalies.len() * 6);
        for (anomaly, tag) in anomalies.iter().zip(&tags) {
            params.push(&anomaly.device_id);
            params.push(&anomaly.point_id);
            params.push(&anomaly.ts);
            params.push(&anomaly.score);
            params.push(tag);
            params.push(&anomaly.flagged);
        }

        let client = &self.client;
        let query = query.as_str();
        let params = params.as_slice();
        let rows = with_retries("insert_anomalies", DEFAULT_WRITE_ATTEMPTS, || async move {
            let conn = client.get_connection().await?;
            Ok(conn.query(query, params).await?)
        })
        .await?;

        // Map each returned row back to the batch position that carries its
        // key. Identical rows within one batch collapse onto the first.
        let mut index_by_key: HashMap<(&str, Option<i64>, DetectorKind), usize> = HashMap::new();
        for (index, anomaly) in anomalies.iter().enumerate() {
            index_by_key
                .entry((anomaly.device_id.as_str(), anomaly.point_id, anomaly.detector))
                .or_insert(index);
        }

        let mut persisted = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.get(0);
            let device_id: String = row.get(1);
            let point_id: Option<i64> = row.get(2);
            let detector: String = row.get(3);
            let detector = DetectorKind::parse(&detector)
                .ok_or_else(|| anyhow::anyhow!("unknown detector tag in store: {detector}"))?;
            match index_by_key.get(&(device_id.as_str(), point_id, detector)) {
                Some(&index) => persisted.push((index, id)),
                None => {
                    return Err(DomainError::RepositoryError(anyhow::anyhow!(
                        "insert returned a row not present in the batch: anomaly {id}"
                    )))
                }
            }
        }
        persisted.sort_unstable_by_key(|(index, _)| *index);

        debug!(
            "inserted {} of {} anomalies",
            persisted.len(),
            anomalies.len()
        );
        Ok(persisted)
    }

    #[instrument(skip(self, query))]
    async fn list_anomalies(&self, query: AnomalyQuery) -> DomainResult<Vec<Anomaly>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let detector = query.detector.map(|k| k.as_str().to_string());
        let (clause, mut params) = anomaly_filters(&query, &detector);
        params.push(&query.limit);
        let limit_idx = params.len();
        params.push(&query.offset);
        let offset_idx = params.len();

        let sql = format!(
            "SELECT {ANOMALY_COLUMNS} FROM anomalies{clause}
             ORDER BY ts DESC LIMIT ${limit_idx} OFFSET ${offset_idx}"
        );
        let rows = conn
            .query(sql.as_str(), &params)
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        rows.iter().map(anomaly_from_row).collect()
    }

    #[instrument(skip(self, query))]
    async fn count_anomalies(&self, query: AnomalyQuery) -> DomainResult<i64> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let detector = query.detector.map(|k| k.as_str().to_string());
        let (clause, params) = anomaly_filters(&query, &detector);
        let sql = format!("SELECT COUNT(*) FROM anomalies{clause}");
        let row = conn
            .query_one(sql.as_str(), &params)
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.get(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anomaly_filters_detector_and_flagged() {
        let query = AnomalyQuery {
            device_id: Some("dev-1".to_string()),
            detector: Some(DetectorKind::ZScore),
            flagged: Some(true),
            ..Default::default()
        };
        let detector = query.detector.map(|k| k.as_str().to_string());
        let (clause, params) = anomaly_filters(&query, &detector);
        assert_eq!(
            clause,
            " WHERE device_id = $1 AND detector = $2 AND flagged = $3"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_anomaly_filters_empty() {
        let query = AnomalyQuery::default();
        let detector = query.detector.map(|k| k.as_str().to_string());
        let (clause, params) = anomaly_filters(&query, &detector);
        assert_eq!(clause, "");
        assert!(params.is_empty());
    }
}
