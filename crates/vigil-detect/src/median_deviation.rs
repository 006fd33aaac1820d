use async_trait::async_trait;
use std::collections::VecDeque;
use vigil_domain::{Detector, DetectorKind, Point, Scored};

/// MAD values below this floor are clamped to avoid division blow-ups on
/// near-constant streams.
const MAD_FLOOR: f64 = 1.0;

/// Tuning for the multivariate median-deviation detector.
#[derive(Debug, Clone)]
pub struct MedianDeviationConfig {
    pub window_size: usize,
    /// Points whose deviation lands in the top `100 - threshold_percentile`
    /// percent of the window are flagged.
    pub threshold_percentile: f64,
}

impl Default for MedianDeviationConfig {
    fn default() -> Self {
        Self {
            window_size: 512,
            threshold_percentile: 95.0,
        }
    }
}

/// Robust multivariate outlier scorer over the most recent N feature vectors.
///
/// Each scoring call appends the batch to the window, recomputes per-feature
/// median and MAD, and flags new points whose mean normalised deviation
/// exceeds the window's top-percentile cut.
pub struct MedianDeviationDetector {
    config: MedianDeviationConfig,
    window: VecDeque<[f64; 4]>,
}

impl MedianDeviationDetector {
    pub fn new(config: MedianDeviationConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
        }
    }

    fn push(&mut self, features: [f64; 4]) {
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(features);
    }

    /// Per-feature median and MAD (floored) over the current window.
    fn window_stats(&self) -> ([f64; 4], [f64; 4]) {
        let mut medians = [0.0; 4];
        let mut mads = [0.0; 4];
        for feature in 0..4 {
            let mut values: Vec<f64> = self.window.iter().map(|v| v[feature]).collect();
            medians[feature] = median_in_place(&mut values);
            let mut deviations: Vec<f64> =
                values.iter().map(|v| (v - medians[feature]).abs()).collect();
            mads[feature] = median_in_place(&mut deviations).max(MAD_FLOOR);
        }
        (medians, mads)
    }

    fn deviation(features: &[f64; 4], medians: &[f64; 4], mads: &[f64; 4]) -> f64 {
        let total: f64 = features
            .iter()
            .zip(medians.iter().zip(mads.iter()))
            .map(|(x, (med, mad))| (x - med).abs() / mad)
            .sum();
        total / 4.0
    }

    /// Deviation value at the window's top `100 - P` percent cut.
    ///
    /// The cut index is kept off the single largest deviation so a fresh
    /// outlier is compared against the rest of the window, not itself.
    fn window_threshold(&self, deviations: &mut [f64]) -> f64 {
        deviations.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let n = deviations.len();
        let cut = (n as f64 * (100.0 - self.config.threshold_percentile) / 100.0) as usize;
        deviations[cut.clamp(1, n - 1)]
    }
}

fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[async_trait]
impl Detector for MedianDeviationDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::MedianDeviation
    }

    fn window_capacity(&self) -> usize {
        self.config.window_size
    }

    fn warm(&mut self, history: &[Point]) {
        for point in history {
            self.push(point.features());
        }
    }

    async fn score_batch(&mut self, points: &[Point]) -> Vec<Scored> {
        for point in points {
            self.push(point.features());
        }

        if self.window.len() < 2 {
            return points
                .iter()
                .map(|point| Scored {
                    point: point.clone(),
                    score: 0.0,
                    is_anomaly: false,
                    detector: DetectorKind::MedianDeviation,
                })
                .collect();
        }

        let (medians, mads) = self.window_stats();
        let mut window_deviations: Vec<f64> = self
            .window
            .iter()
            .map(|features| Self::deviation(features, &medians, &mads))
            .collect();
        let threshold = self.window_threshold(&mut window_deviations);

        points
            .iter()
            .map(|point| {
                let score = Self::deviation(&point.features(), &medians, &mads);
                Scored {
                    point: point.clone(),
                    score,
                    is_anomaly: score > threshold,
                    detector: DetectorKind::MedianDeviation,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn point(offset: f64) -> Point {
        Point {
            id: None,
            device_id: "dev-1".to_string(),
            ts: Utc::now(),
            temperature_c: 22.0 + offset,
            vibration_g: 0.1 + offset,
            humidity_pct: 40.0 + offset,
            voltage_v: 12.0 + offset,
        }
    }

    fn detector(window: usize) -> MedianDeviationDetector {
        MedianDeviationDetector::new(MedianDeviationConfig {
            window_size: window,
            threshold_percentile: 95.0,
        })
    }

    #[tokio::test]
    async fn test_underfilled_window_scores_zero() {
        let mut det = detector(20);
        let results = det.score_batch(&[point(0.0)]).await;
        assert_eq!(results[0].score, 0.0);
        assert!(!results[0].is_anomaly);
    }

    #[tokio::test]
    async fn test_nominal_batch_produces_no_anomalies() {
        let mut det = detector(20);
        let nominal: Vec<Point> = (0..15).map(|_| point(0.0)).collect();
        let results = det.score_batch(&nominal).await;
        assert!(results.iter().all(|r| !r.is_anomaly));
    }

    #[tokio::test]
    async fn test_distant_point_flags_after_nominal_fill() {
        let mut det = detector(20);
        let nominal: Vec<Point> = (0..15).map(|_| point(0.0)).collect();
        let first = det.score_batch(&nominal).await;
        assert_eq!(first.iter().filter(|r| r.is_anomaly).count(), 0);

        // All four metrics pushed 5 MAD-floors off the median.
        let results = det.score_batch(&[point(5.0)]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_anomaly);
        assert!((results[0].score - 5.0).abs() < 1e-9);
        assert_eq!(results[0].detector, DetectorKind::MedianDeviation);
    }

    #[tokio::test]
    async fn test_saturated_window_still_flags_distant_point() {
        let mut det = detector(64);
        for _ in 0..80 {
            det.score_batch(&[point(0.0)]).await;
        }
        assert_eq!(det.window.len(), 64);
        let results = det.score_batch(&[point(40.0)]).await;
        assert!(results[0].is_anomaly);
    }

    #[tokio::test]
    async fn test_mad_floor_prevents_divide_by_zero() {
        let mut det = detector(20);
        let constant: Vec<Point> = (0..10).map(|_| point(0.0)).collect();
        let results = det.score_batch(&constant).await;
        assert!(results.iter().all(|r| r.score == 0.0 && !r.is_anomaly));
    }

    #[tokio::test]
    async fn test_window_is_fifo_bounded() {
        let mut det = detector(8);
        for i in 0..20 {
            det.score_batch(&[point(i as f64 * 0.001)]).await;
        }
        assert_eq!(det.window.len(), 8);
        // Oldest entries evicted: the smallest offsets are gone.
        let min_temp = det
            .window
            .iter()
            .map(|v| v[0])
            .fold(f64::INFINITY, f64::min);
        assert!(min_temp >= 22.0 + 12.0 * 0.001 - 1e-12);
    }

    #[test]
    fn test_median_of_even_and_odd_sets() {
        assert_eq!(median_in_place(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_in_place(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median_in_place(&mut []), 0.0);
    }
}
