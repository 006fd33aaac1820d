use crate::zscore::{ZScoreConfig, ZScoreDetector};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vigil_domain::{Detector, DetectorKind, Point, Scored};

/// One per-index result from the external scorer.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScoreEntry {
    pub index: usize,
    pub score: f64,
    #[serde(rename = "isAnomaly")]
    pub is_anomaly: bool,
}

/// RPC boundary to the external scorer, mockable for tests.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait ScoreRpc: Send + Sync {
    async fn score_batch(
        &self,
        device_id: &str,
        points: &[Point],
    ) -> anyhow::Result<Vec<ScoreEntry>>;

    async fn health(&self) -> bool;
}

#[derive(Serialize)]
struct WirePoint {
    ts: DateTime<Utc>,
    temperature_c: f64,
    vibration_g: f64,
    humidity_pct: f64,
    voltage_v: f64,
}

impl From<&Point> for WirePoint {
    fn from(point: &Point) -> Self {
        Self {
            ts: point.ts,
            temperature_c: point.temperature_c,
            vibration_g: point.vibration_g,
            humidity_pct: point.humidity_pct,
            voltage_v: point.voltage_v,
        }
    }
}

#[derive(Serialize)]
struct ScoreBatchRequest<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    points: Vec<WirePoint>,
}

#[derive(Deserialize)]
struct ScoreBatchResponse {
    scores: Vec<ScoreEntry>,
}

#[derive(Deserialize)]
struct HealthResponse {
    ok: bool,
}

/// HTTP client for the `/score-batch` scorer service.
pub struct ExternalClient {
    http: reqwest::Client,
    base_url: String,
}

impl ExternalClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ScoreRpc for ExternalClient {
    async fn score_batch(
        &self,
        device_id: &str,
        points: &[Point],
    ) -> anyhow::Result<Vec<ScoreEntry>> {
        let request = ScoreBatchRequest {
            device_id,
            points: points.iter().map(WirePoint::from).collect(),
        };
        let response = self
            .http
            .post(format!("{}/score-batch", self.base_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: ScoreBatchResponse = response.json().await?;
        Ok(body.scores)
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response
                .json::<HealthResponse>()
                .await
                .map(|h| h.ok)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Detector that defers scoring to the external service.
///
/// Points accumulate in a per-device buffer and are dispatched once the
/// batch threshold is reached. Any RPC failure scores the dispatched buffer
/// with a private z-score fallback instead; results are tagged with the
/// detector that actually scored them. The fallback windows are fed on
/// success too, so they are warm when a failure arrives.
pub struct ExternalDetector {
    device_id: String,
    rpc: Arc<dyn ScoreRpc>,
    batch_size: usize,
    pending: Vec<Point>,
    fallback: ZScoreDetector,
}

impl ExternalDetector {
    pub fn new(
        device_id: &str,
        rpc: Arc<dyn ScoreRpc>,
        batch_size: usize,
        fallback_config: ZScoreConfig,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            rpc,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            fallback: ZScoreDetector::new(fallback_config),
        }
    }

    async fn dispatch(&mut self) -> Vec<Scored> {
        let batch = std::mem::take(&mut self.pending);
        match self.rpc.score_batch(&self.device_id, &batch).await {
            Ok(entries) => {
                debug!(
                    device_id = %self.device_id,
                    points = batch.len(),
                    "external scorer returned batch"
                );
                for point in &batch {
                    self.fallback.observe(point);
                }
                let by_index: HashMap<usize, ScoreEntry> =
                    entries.into_iter().map(|e| (e.index, e)).collect();
                batch
                    .into_iter()
                    .enumerate()
                    .map(|(index, point)| {
                        let entry = by_index.get(&index);
                        Scored {
                            point,
                            score: entry.map(|e| e.score.max(0.0)).unwrap_or(0.0),
                            is_anomaly: entry.map(|e| e.is_anomaly).unwrap_or(false),
                            detector: DetectorKind::External,
                        }
                    })
                    .collect()
            }
            Err(e) => {
                warn!(
                    device_id = %self.device_id,
                    points = batch.len(),
                    error = %e,
                    "external scorer unavailable, scoring batch with z-score fallback"
                );
                self.fallback.score_batch(&batch).await
            }
        }
    }
}

#[async_trait]
impl Detector for ExternalDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::External
    }

    fn window_capacity(&self) -> usize {
        self.fallback.window_capacity()
    }

    /// The scorer service keeps its own per-device windows; only the local
    /// fallback needs warming.
    fn warm(&mut self, history: &[Point]) {
        self.fallback.warm(history);
    }

    async fn score_batch(&mut self, points: &[Point]) -> Vec<Scored> {
        self.pending.extend_from_slice(points);
        if self.pending.len() < self.batch_size {
            return Vec::new();
        }
        self.dispatch().await
    }

    async fn flush(&mut self) -> Vec<Scored> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let batch = std::mem::take(&mut self.pending);
        warn!(
            device_id = %self.device_id,
            points = batch.len(),
            "flushing buffered points through z-score fallback"
        );
        self.fallback.score_batch(&batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn point(temperature: f64) -> Point {
        Point {
            id: None,
            device_id: "dev-1".to_string(),
            ts: Utc::now(),
            temperature_c: temperature,
            vibration_g: 0.1,
            humidity_pct: 40.0,
            voltage_v: 12.0,
        }
    }

    fn batch(n: usize) -> Vec<Point> {
        (0..n).map(|_| point(22.0)).collect()
    }

    #[tokio::test]
    async fn test_buffers_until_batch_threshold() {
        let mut rpc = MockScoreRpc::new();
        rpc.expect_score_batch().times(0);

        let mut detector =
            ExternalDetector::new("dev-1", Arc::new(rpc), 64, ZScoreConfig::default());
        let results = detector.score_batch(&batch(63)).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_dispatches_full_batch_and_maps_by_index() {
        let mut rpc = MockScoreRpc::new();
        rpc.expect_score_batch()
            .withf(|device_id: &str, points: &[Point]| device_id == "dev-1" && points.len() == 64)
            .times(1)
            .returning(|_, points| {
                Ok((0..points.len())
                    .map(|index| ScoreEntry {
                        index,
                        score: 0.5,
                        is_anomaly: index == 10,
                    })
                    .collect())
            });

        let mut detector =
            ExternalDetector::new("dev-1", Arc::new(rpc), 64, ZScoreConfig::default());
        let results = detector.score_batch(&batch(64)).await;
        assert_eq!(results.len(), 64);
        assert!(results[10].is_anomaly);
        assert!(results.iter().all(|r| r.detector == DetectorKind::External));
    }

    #[tokio::test]
    async fn test_rpc_failure_falls_back_to_zscore_tag() {
        let mut rpc = MockScoreRpc::new();
        rpc.expect_score_batch()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("connect refused")));

        let mut detector =
            ExternalDetector::new("dev-1", Arc::new(rpc), 64, ZScoreConfig::default());
        let mut points = batch(63);
        points.push(point(40.0));

        let results = detector.score_batch(&points).await;
        assert_eq!(results.len(), 64);
        assert!(results.iter().all(|r| r.detector == DetectorKind::ZScore));
        // The fallback still catches the spike inside the failed batch.
        assert!(results.last().unwrap().is_anomaly);
    }

    #[tokio::test]
    async fn test_failure_is_transient_across_batches() {
        let mut rpc = MockScoreRpc::new();
        let mut call = 0;
        rpc.expect_score_batch().times(2).returning(move |_, points| {
            call += 1;
            if call == 1 {
                Err(anyhow::anyhow!("timeout"))
            } else {
                Ok((0..points.len())
                    .map(|index| ScoreEntry {
                        index,
                        score: 0.1,
                        is_anomaly: false,
                    })
                    .collect())
            }
        });

        let mut detector =
            ExternalDetector::new("dev-1", Arc::new(rpc), 4, ZScoreConfig::default());
        let first = detector.score_batch(&batch(4)).await;
        assert!(first.iter().all(|r| r.detector == DetectorKind::ZScore));
        let second = detector.score_batch(&batch(4)).await;
        assert!(second.iter().all(|r| r.detector == DetectorKind::External));
    }

    #[tokio::test]
    async fn test_flush_scores_pending_with_fallback() {
        let mut rpc = MockScoreRpc::new();
        rpc.expect_score_batch().times(0);

        let mut detector =
            ExternalDetector::new("dev-1", Arc::new(rpc), 64, ZScoreConfig::default());
        assert!(detector.score_batch(&batch(10)).await.is_empty());

        let flushed = detector.flush().await;
        assert_eq!(flushed.len(), 10);
        assert!(flushed.iter().all(|r| r.detector == DetectorKind::ZScore));
        assert!(detector.flush().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_scorer_end_to_end() {
        // Real client pointed at a port nobody listens on: transport error,
        // batch lands on the fallback.
        let client = ExternalClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let mut detector =
            ExternalDetector::new("dev-1", Arc::new(client), 4, ZScoreConfig::default());
        let results = detector.score_batch(&batch(4)).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.detector == DetectorKind::ZScore));
    }
}
