mod external;
mod median_deviation;
mod registry;
mod zscore;

pub use external::{ExternalClient, ExternalDetector, ScoreEntry, ScoreRpc};
pub use median_deviation::{MedianDeviationConfig, MedianDeviationDetector};
pub use registry::{DetectorRegistry, RegistryConfig};
pub use zscore::{ZScoreConfig, ZScoreDetector};

#[cfg(any(test, feature = "mocks"))]
pub use external::MockScoreRpc;
