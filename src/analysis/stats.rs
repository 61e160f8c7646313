//! Descriptive statistics over count series.

use serde::{Deserialize, Serialize};

/// Samples this many standard deviations (or more) from the mean are
/// discarded before a baseline is computed.
pub const OUTLIER_SIGMA: f64 = 3.0;

/// Below this many samples, outlier rejection is skipped.
pub const MIN_SAMPLES_FOR_OUTLIERS: usize = 3;

/// A simple series of observations.
#[derive(Debug, Clone, Default)]
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn from_counts(counts: &[u64]) -> Self {
        Self::new(counts.iter().map(|&c| c as f64).collect())
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Percentile `p` (0-100) with linear interpolation between the floor and
    /// ceiling ranks, `rank = p/100 * (n-1)`. Returns 0 for an empty series.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);

        let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return sorted[lower];
        }
        let weight = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * weight
    }

    /// Copy of the series keeping only samples strictly within `sigma`
    /// standard deviations of the mean. Short and constant series come back
    /// unchanged.
    pub fn without_outliers(&self, sigma: f64) -> TimeSeries {
        if self.values.len() < MIN_SAMPLES_FOR_OUTLIERS {
            return self.clone();
        }
        let mean = self.mean();
        let std = self.std_dev();
        if std == 0.0 {
            return self.clone();
        }
        let kept = self
            .values
            .iter()
            .copied()
            .filter(|x| (x - mean).abs() < sigma * std)
            .collect();
        TimeSeries::new(kept)
    }

    /// Pearson correlation coefficient with `other`. `None` when the lengths
    /// differ, there are fewer than two points, or either side is constant.
    pub fn pearson(&self, other: &TimeSeries) -> Option<f64> {
        let n = self.values.len();
        if n != other.values.len() || n < 2 {
            return None;
        }
        let mx = self.mean();
        let my = other.mean();

        let mut cov = 0.0;
        let mut vx = 0.0;
        let mut vy = 0.0;
        for (x, y) in self.values.iter().zip(&other.values) {
            let dx = x - mx;
            let dy = y - my;
            cov += dx * dy;
            vx += dx * dx;
            vy += dy * dy;
        }
        if vx == 0.0 || vy == 0.0 {
            return None;
        }
        Some((cov / (vx.sqrt() * vy.sqrt())).clamp(-1.0, 1.0))
    }
}

/// Summary statistics of a cleaned count series.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BaselineStats {
    pub mean: f64,
    pub std_dev: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_size: u64,
}

/// Compute baseline statistics from per-bucket occurrence counts.
///
/// With at least three samples, values beyond three standard deviations are
/// dropped and the statistics recomputed on what is left. An empty input (or
/// an empty cleaned set) yields all zeros.
pub fn compute_baseline(counts: &[u64]) -> BaselineStats {
    let raw = TimeSeries::from_counts(counts);
    let cleaned = raw.without_outliers(OUTLIER_SIGMA);
    if cleaned.is_empty() {
        return BaselineStats::default();
    }
    BaselineStats {
        mean: cleaned.mean(),
        std_dev: cleaned.std_dev(),
        p95: cleaned.percentile(95.0),
        p99: cleaned.percentile(99.0),
        sample_size: cleaned.len() as u64,
    }
}
