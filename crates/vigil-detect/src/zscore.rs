use async_trait::async_trait;
use std::collections::VecDeque;
use vigil_domain::{Detector, DetectorKind, Point, Scored};

/// Tuning for the per-metric rolling z-score detector.
#[derive(Debug, Clone)]
pub struct ZScoreConfig {
    pub window_size: usize,
    pub threshold: f64,
}

impl Default for ZScoreConfig {
    fn default() -> Self {
        Self {
            window_size: 200,
            threshold: 3.0,
        }
    }
}

/// Ring window over one metric with running sum and sum of squares, so mean
/// and variance are O(1) per value.
#[derive(Debug, Default)]
struct RollingStats {
    values: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl RollingStats {
    fn push(&mut self, value: f64, cap: usize) {
        if self.values.len() == cap {
            if let Some(evicted) = self.values.pop_front() {
                self.sum -= evicted;
                self.sum_sq -= evicted * evicted;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    /// |x − μ| / σ with Bessel-corrected variance over the current window.
    /// Degenerate windows (n < 2 or σ ≤ 0) score 0.
    fn zscore(&self, value: f64) -> f64 {
        let n = self.values.len() as f64;
        if n < 2.0 {
            return 0.0;
        }
        let mean = self.sum / n;
        let variance = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        if variance <= 0.0 {
            return 0.0;
        }
        (value - mean).abs() / variance.sqrt()
    }
}

/// Univariate rolling z-score over each of the four metrics.
///
/// A new value is appended to its window before being scored, so a spike is
/// judged against a window that includes it and later points in the same
/// batch see every earlier one.
pub struct ZScoreDetector {
    config: ZScoreConfig,
    metrics: [RollingStats; 4],
}

impl ZScoreDetector {
    pub fn new(config: ZScoreConfig) -> Self {
        Self {
            config,
            metrics: Default::default(),
        }
    }

    /// Max z over the four metrics, updating every window.
    fn score_point(&mut self, point: &Point) -> f64 {
        let mut max_z = 0.0f64;
        for (stats, value) in self.metrics.iter_mut().zip(point.features()) {
            stats.push(value, self.config.window_size);
            max_z = max_z.max(stats.zscore(value));
        }
        max_z
    }

    /// Feed the windows without producing a score. Used to keep a fallback
    /// instance warm while another detector is doing the scoring.
    pub fn observe(&mut self, point: &Point) {
        for (stats, value) in self.metrics.iter_mut().zip(point.features()) {
            stats.push(value, self.config.window_size);
        }
    }
}

#[async_trait]
impl Detector for ZScoreDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::ZScore
    }

    fn window_capacity(&self) -> usize {
        self.config.window_size
    }

    fn warm(&mut self, history: &[Point]) {
        for point in history {
            self.observe(point);
        }
    }

    async fn score_batch(&mut self, points: &[Point]) -> Vec<Scored> {
        points
            .iter()
            .map(|point| {
                let score = self.score_point(point);
                Scored {
                    point: point.clone(),
                    score,
                    is_anomaly: score > self.config.threshold,
                    detector: DetectorKind::ZScore,
                }
            })
            .collect()
    }
}
