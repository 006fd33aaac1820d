use crate::external::{ExternalClient, ExternalDetector, ScoreRpc};
use crate::median_deviation::{MedianDeviationConfig, MedianDeviationDetector};
use crate::zscore::{ZScoreConfig, ZScoreDetector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vigil_domain::{Detector, DetectorFactory, DetectorKind};

/// Engine selection and tuning, resolved from the environment.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub engine: DetectorKind,
    /// Overrides the per-engine default (200 for z-score, 512 for
    /// median-deviation) when set.
    pub window_size: Option<usize>,
    pub zscore_threshold: f64,
    pub threshold_percentile: f64,
    pub external_url: String,
    pub external_timeout: Duration,
    pub external_batch_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            engine: DetectorKind::MedianDeviation,
            window_size: None,
            zscore_threshold: 3.0,
            threshold_percentile: 95.0,
            external_url: "http://localhost:8000".to_string(),
            external_timeout: Duration::from_secs(5),
            external_batch_size: 64,
        }
    }
}

/// Builds per-device detectors for the configured engine.
///
/// Holds only configuration and the shared scorer client; every device
/// worker gets its own detector with its own windows.
pub struct DetectorRegistry {
    config: RegistryConfig,
    external: Option<Arc<dyn ScoreRpc>>,
}

impl DetectorRegistry {
    pub fn new(config: RegistryConfig) -> anyhow::Result<Self> {
        let external = match config.engine {
            DetectorKind::External => {
                let client = ExternalClient::new(&config.external_url, config.external_timeout)?;
                info!(
                    url = %config.external_url,
                    batch_size = config.external_batch_size,
                    "external anomaly scorer configured"
                );
                Some(Arc::new(client) as Arc<dyn ScoreRpc>)
            }
            _ => None,
        };
        Ok(Self { config, external })
    }

    /// Registry with an injected RPC, used by tests.
    pub fn with_rpc(config: RegistryConfig, rpc: Arc<dyn ScoreRpc>) -> Self {
        Self {
            config,
            external: Some(rpc),
        }
    }

    fn zscore_config(&self) -> ZScoreConfig {
        ZScoreConfig {
            window_size: self.config.window_size.unwrap_or(200),
            threshold: self.config.zscore_threshold,
        }
    }

    /// True when the external scorer answers its health probe. Always true
    /// for the local engines.
    pub async fn healthy(&self) -> bool {
        match &self.external {
            Some(rpc) => rpc.health().await,
            None => true,
        }
    }
}

impl DetectorFactory for DetectorRegistry {
    fn create(&self, device_id: &str) -> Box<dyn Detector> {
        match self.config.engine {
            DetectorKind::ZScore => Box::new(ZScoreDetector::new(self.zscore_config())),
            DetectorKind::MedianDeviation => {
                Box::new(MedianDeviationDetector::new(MedianDeviationConfig {
                    window_size: self.config.window_size.unwrap_or(512),
                    threshold_percentile: self.config.threshold_percentile,
                }))
            }
            DetectorKind::External => match &self.external {
                Some(rpc) => Box::new(ExternalDetector::new(
                    device_id,
                    Arc::clone(rpc),
                    self.config.external_batch_size,
                    // Fallback windows use the z-score defaults, not the
                    // external window override.
                    ZScoreConfig {
                        window_size: 200,
                        threshold: self.config.zscore_threshold,
                    },
                )),
                None => {
                    warn!("external engine selected without a scorer client, using z-score");
                    Box::new(ZScoreDetector::new(self.zscore_config()))
                }
            },
        }
    }

    fn engine(&self) -> DetectorKind {
        self.config.engine
    }
}
