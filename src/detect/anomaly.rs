use crate::analysis::baseline::{Baseline, BaselineSet};
use crate::analysis::stats::BaselineStats;
use crate::detect::{AnomalyLevel, AnomalyResult};

pub const DEFAULT_SENSITIVITY: f64 = 2.0;

/// Minimum standard deviations above the mean for each level, highest first.
/// These bands do not move with the sensitivity.
const LEVEL_BANDS: [(f64, AnomalyLevel); 3] = [
    (4.0, AnomalyLevel::Critical),
    (3.0, AnomalyLevel::High),
    (2.0, AnomalyLevel::Elevated),
];

/// Level for a distance from the mean, or `None` below the lowest band.
pub fn classify(std_devs_above: f64) -> Option<AnomalyLevel> {
    LEVEL_BANDS
        .iter()
        .find(|(min, _)| std_devs_above >= *min)
        .map(|(_, level)| *level)
}

/// `mean + sensitivity * std_dev`.
pub fn threshold(stats: &BaselineStats, sensitivity: f64) -> f64 {
    stats.mean + sensitivity * stats.std_dev
}

/// Evaluate `current` against the preferred baseline of `baselines`
/// (hourly, then daily, then weekly).
pub fn evaluate(current: u64, baselines: &BaselineSet, sensitivity: f64) -> AnomalyResult {
    evaluate_against(current, baselines.preferred(), sensitivity)
}

/// Evaluate `current` against a single baseline.
///
/// A count is anomalous when it exceeds the sensitivity threshold and falls
/// into one of the level bands.
pub fn evaluate_against(current: u64, baseline: Option<&Baseline>, sensitivity: f64) -> AnomalyResult {
    let Some(baseline) = baseline else {
        return AnomalyResult {
            is_anomaly: false,
            level: None,
            baseline_type: None,
            threshold: None,
            std_devs_above: None,
            reason: "no baseline available".to_string(),
        };
    };

    let stats = &baseline.stats;
    let limit = threshold(stats, sensitivity);
    let mut result = AnomalyResult {
        is_anomaly: false,
        level: None,
        baseline_type: Some(baseline.granularity),
        threshold: Some(limit),
        std_devs_above: None,
        reason: String::new(),
    };

    if stats.std_dev == 0.0 {
        result.reason = format!(
            "{} baseline has no variance (mean {:.2})",
            baseline.granularity, stats.mean
        );
        return result;
    }

    let current_f = current as f64;
    let sigmas = (current_f - stats.mean) / stats.std_dev;
    result.std_devs_above = Some(sigmas);

    match classify(sigmas) {
        Some(level) if current_f > limit => {
            result.is_anomaly = true;
            result.level = Some(level);
            result.reason = format!(
                "count {current} is {sigmas:.2} std devs above the {} mean {:.2} (threshold {limit:.2})",
                baseline.granularity, stats.mean
            );
        }
        _ => {
            result.reason = format!(
                "count {current} within {sensitivity} std devs of the {} mean {:.2}",
                baseline.granularity, stats.mean
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::baseline::Granularity;
    use crate::occurrence::ErrorKey;
    use chrono::{Duration, TimeZone, Utc};

    fn baseline(g: Granularity, mean: f64, std_dev: f64) -> Baseline {
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let stats = BaselineStats {
            mean,
            std_dev,
            p95: mean + 2.0 * std_dev,
            p99: mean + 3.0 * std_dev,
            sample_size: 100,
        };
        Baseline::new(&ErrorKey::new("E", "ios"), g, end - Duration::weeks(4), end, stats).unwrap()
    }

    fn hourly(mean: f64, std_dev: f64) -> BaselineSet {
        let mut set = BaselineSet::default();
        set.insert(baseline(Granularity::Hourly, mean, std_dev));
        set
    }

    #[test]
    fn test_elevated_and_critical() {
        let set = hourly(10.0, 2.0);

        let r = evaluate(15, &set, DEFAULT_SENSITIVITY);
        assert!(r.is_anomaly);
        assert_eq!(r.std_devs_above, Some(2.5));
        assert_eq!(r.level, Some(AnomalyLevel::Elevated));
        assert_eq!(r.threshold, Some(14.0));
        assert_eq!(r.baseline_type, Some(Granularity::Hourly));

        let r = evaluate(20, &set, DEFAULT_SENSITIVITY);
        assert_eq!(r.level, Some(AnomalyLevel::Critical));

        let r = evaluate(17, &set, DEFAULT_SENSITIVITY);
        assert_eq!(r.level, Some(AnomalyLevel::High));
    }

    #[test]
    fn test_below_threshold_is_normal() {
        let r = evaluate(13, &hourly(10.0, 2.0), DEFAULT_SENSITIVITY);
        assert!(!r.is_anomaly);
        assert_eq!(r.level, None);
        assert_eq!(r.std_devs_above, Some(1.5));
    }

    #[test]
    fn test_sensitivity_raises_threshold() {
        // 2.5 sigma is elevated, but not above a 3-sigma threshold.
        let r = evaluate(15, &hourly(10.0, 2.0), 3.0);
        assert!(!r.is_anomaly);
        assert_eq!(r.threshold, Some(16.0));
    }

    #[test]
    fn test_missing_baseline() {
        let r = evaluate(1_000, &BaselineSet::default(), DEFAULT_SENSITIVITY);
        assert!(!r.is_anomaly);
        assert_eq!(r.baseline_type, None);
        assert_eq!(r.reason, "no baseline available");
    }

    #[test]
    fn test_zero_variance_baseline() {
        let r = evaluate(50, &hourly(2.0, 0.0), DEFAULT_SENSITIVITY);
        assert!(!r.is_anomaly);
        assert_eq!(r.std_devs_above, None);
        assert_eq!(r.threshold, Some(2.0));
    }

    #[test]
    fn test_falls_back_to_daily() {
        let mut set = BaselineSet::default();
        set.insert(baseline(Granularity::Weekly, 100.0, 10.0));
        set.insert(baseline(Granularity::Daily, 10.0, 2.0));
        let r = evaluate(20, &set, DEFAULT_SENSITIVITY);
        assert_eq!(r.baseline_type, Some(Granularity::Daily));
        assert_eq!(r.level, Some(AnomalyLevel::Critical));
    }

    #[test]
    fn test_classify_bands() {
        assert_eq!(classify(1.99), None);
        assert_eq!(classify(2.0), Some(AnomalyLevel::Elevated));
        assert_eq!(classify(3.0), Some(AnomalyLevel::High));
        assert_eq!(classify(3.99), Some(AnomalyLevel::High));
        assert_eq!(classify(4.0), Some(AnomalyLevel::Critical));
        assert_eq!(classify(-5.0), None);
    }
}
