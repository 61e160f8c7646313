//! Cyclical patterns and bursts in one identity's occurrence times.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::Serialize;

use crate::analysis::lookback_from;
use crate::analysis::stats::TimeSeries;
use crate::config::BurstConfig;
use crate::detect::DetectError;
use crate::occurrence::IdentityId;
use crate::storage::OccurrenceRepository;

/// Shape of an hour-of-day / day-of-week distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    BusinessHours,
    Night,
    Weekend,
    Uniform,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CyclicalPattern {
    pub pattern_type: PatternType,
    /// Hours (UTC) whose count exceeds twice the mean hourly count.
    pub peak_hours: Vec<u32>,
    pub hourly_distribution: [u64; 24],
    /// Index 0 is Sunday.
    pub weekday_distribution: [u64; 7],
    /// Coefficient of variation of the hourly histogram, clamped to [0, 1].
    pub strength: f64,
}

struct Histograms<'a> {
    peak_hours: &'a [u32],
    weekday: &'a [u64; 7],
    total: u64,
}

fn business_hours(h: &Histograms<'_>) -> bool {
    h.peak_hours.iter().filter(|hr| (9..=17).contains(*hr)).count() >= 3
}

fn night(h: &Histograms<'_>) -> bool {
    h.peak_hours.iter().filter(|hr| (0..=6).contains(*hr)).count() >= 2
}

fn weekend(h: &Histograms<'_>) -> bool {
    h.total > 0 && (h.weekday[0] + h.weekday[6]) as f64 > h.total as f64 * 0.5
}

type PatternRule = (fn(&Histograms<'_>) -> bool, PatternType);

/// Checked in order; the first match wins.
const PATTERN_RULES: [PatternRule; 3] = [
    (business_hours, PatternType::BusinessHours),
    (night, PatternType::Night),
    (weekend, PatternType::Weekend),
];

/// Hour-of-day and weekday profile of `timestamps`.
pub fn cyclical_pattern(timestamps: &[DateTime<Utc>]) -> CyclicalPattern {
    let mut hourly = [0u64; 24];
    let mut weekday = [0u64; 7];
    for ts in timestamps {
        hourly[ts.hour() as usize] += 1;
        weekday[ts.weekday().num_days_from_sunday() as usize] += 1;
    }

    let total = timestamps.len() as u64;
    let series = TimeSeries::from_counts(&hourly);
    let mean = series.mean();

    let peak_hours: Vec<u32> = if total == 0 {
        Vec::new()
    } else {
        (0u32..24)
            .filter(|&h| hourly[h as usize] as f64 > 2.0 * mean)
            .collect()
    };

    let view = Histograms {
        peak_hours: &peak_hours,
        weekday: &weekday,
        total,
    };
    let pattern_type = PATTERN_RULES
        .iter()
        .find(|(applies, _)| applies(&view))
        .map(|(_, tag)| *tag)
        .unwrap_or(PatternType::Uniform);

    let strength = if mean > 0.0 {
        (series.std_dev() / mean).clamp(0.0, 1.0)
    } else {
        0.0
    };

    CyclicalPattern {
        pattern_type,
        peak_hours,
        hourly_distribution: hourly,
        weekday_distribution: weekday,
        strength,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstIntensity {
    Low,
    Medium,
    High,
}

const INTENSITY_BANDS: [(usize, BurstIntensity); 2] =
    [(20, BurstIntensity::High), (10, BurstIntensity::Medium)];

impl BurstIntensity {
    pub fn for_count(count: usize) -> Self {
        INTENSITY_BANDS
            .iter()
            .find(|(min, _)| count >= *min)
            .map(|(_, level)| *level)
            .unwrap_or(BurstIntensity::Low)
    }
}

/// A tight cluster of occurrences.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Burst {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_seconds: i64,
    pub error_count: usize,
    pub intensity: BurstIntensity,
}

impl Burst {
    fn from_run(run: &[DateTime<Utc>]) -> Self {
        let start = run[0];
        let end = run[run.len() - 1];
        Self {
            start,
            end,
            duration_seconds: (end - start).num_seconds(),
            error_count: run.len(),
            intensity: BurstIntensity::for_count(run.len()),
        }
    }
}

/// Maximal runs whose consecutive gaps are at most `max_gap_seconds`,
/// reported when they hold at least `min_size` occurrences.
pub fn detect_bursts(timestamps: &[DateTime<Utc>], config: &BurstConfig) -> Vec<Burst> {
    if timestamps.len() < config.min_size {
        return Vec::new();
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort();

    // A gap too large for chrono to represent never splits a run.
    let max_gap = Duration::try_seconds(config.max_gap_seconds);
    let mut bursts = Vec::new();
    let mut run_start = 0;
    for i in 1..=sorted.len() {
        let breaks = i == sorted.len() || max_gap.is_some_and(|gap| sorted[i] - sorted[i - 1] > gap);
        if breaks {
            let run = &sorted[run_start..i];
            if run.len() >= config.min_size {
                bursts.push(Burst::from_run(run));
            }
            run_start = i;
        }
    }
    bursts
}

/// Pattern and burst analysis of one identity.
#[derive(Debug, Clone, Serialize)]
pub struct PatternReport {
    pub identity_id: IdentityId,
    pub days: i64,
    pub occurrences: usize,
    pub cyclical: CyclicalPattern,
    pub bursts: Vec<Burst>,
}

/// Reads an identity's recent history and runs both analyses on it.
pub struct PatternDetector<S> {
    store: S,
    bursts: BurstConfig,
}

impl<S: OccurrenceRepository> PatternDetector<S> {
    pub fn new(store: S, bursts: BurstConfig) -> Self {
        Self { store, bursts }
    }

    pub fn analyze(
        &self,
        identity: IdentityId,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<PatternReport, DetectError> {
        let since = lookback_from(now, days, Duration::try_days, "days")?;
        let timestamps = self.store.identity_timestamps(identity, since)?;
        Ok(PatternReport {
            identity_id: identity,
            days,
            occurrences: timestamps.len(),
            cyclical: cyclical_pattern(&timestamps),
            bursts: detect_bursts(&timestamps, &self.bursts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // May 2024: the 1st is a Wednesday, the 4th a Saturday.
    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, minute, 0).unwrap()
    }

    fn spaced(start: DateTime<Utc>, n: usize, gap: Duration) -> Vec<DateTime<Utc>> {
        (0..n).map(|i| start + gap * i as i32).collect()
    }

    #[test]
    fn test_bursts_tight_cluster() {
        let ts = spaced(at(1, 12, 0), 6, Duration::seconds(10));
        let bursts = detect_bursts(&ts, &BurstConfig::default());
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].error_count, 6);
        assert_eq!(bursts[0].duration_seconds, 50);
        assert_eq!(bursts[0].intensity, BurstIntensity::Low);
    }

    #[test]
    fn test_bursts_sparse_timestamps() {
        let ts = spaced(at(1, 12, 0), 6, Duration::minutes(5));
        assert!(detect_bursts(&ts, &BurstConfig::default()).is_empty());
    }

    #[test]
    fn test_bursts_unrepresentable_gap_keeps_one_run() {
        let ts = spaced(at(1, 12, 0), 6, Duration::minutes(5));
        let config = BurstConfig {
            max_gap_seconds: i64::MAX,
            ..BurstConfig::default()
        };
        let bursts = detect_bursts(&ts, &config);
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].error_count, 6);
    }

    #[test]
    fn test_bursts_need_enough_samples() {
        let ts = spaced(at(1, 12, 0), 4, Duration::seconds(1));
        assert!(detect_bursts(&ts, &BurstConfig::default()).is_empty());
    }

    #[test]
    fn test_bursts_split_and_unsorted_input() {
        let mut ts = spaced(at(1, 12, 0), 12, Duration::seconds(30));
        ts.extend(spaced(at(1, 14, 0), 3, Duration::seconds(30)));
        ts.extend(spaced(at(1, 16, 0), 25, Duration::seconds(2)));
        ts.reverse();

        let bursts = detect_bursts(&ts, &BurstConfig::default());
        assert_eq!(bursts.len(), 2);
        assert_eq!(bursts[0].error_count, 12);
        assert_eq!(bursts[0].intensity, BurstIntensity::Medium);
        assert_eq!(bursts[1].error_count, 25);
        assert_eq!(bursts[1].intensity, BurstIntensity::High);
    }

    #[test]
    fn test_business_hours_pattern() {
        let mut ts = Vec::new();
        for hour in [10, 11, 14, 15] {
            ts.extend(spaced(at(1, hour, 0), 10, Duration::minutes(1)));
        }
        ts.push(at(1, 2, 0));
        let p = cyclical_pattern(&ts);
        assert_eq!(p.pattern_type, PatternType::BusinessHours);
        assert_eq!(p.peak_hours, vec![10, 11, 14, 15]);
        assert_eq!(p.hourly_distribution.iter().sum::<u64>(), 41);
        assert_eq!(p.weekday_distribution[3], 41);
        assert!(p.strength > 0.0 && p.strength <= 1.0);
    }

    #[test]
    fn test_business_hours_wins_over_night() {
        let mut ts = Vec::new();
        for hour in [1, 3, 9, 12, 17] {
            ts.extend(spaced(at(1, hour, 0), 10, Duration::minutes(1)));
        }
        assert_eq!(cyclical_pattern(&ts).pattern_type, PatternType::BusinessHours);
    }

    #[test]
    fn test_night_pattern() {
        let mut ts = Vec::new();
        for hour in [1, 4] {
            ts.extend(spaced(at(1, hour, 0), 10, Duration::minutes(1)));
        }
        assert_eq!(cyclical_pattern(&ts).pattern_type, PatternType::Night);
    }

    #[test]
    fn test_weekend_pattern() {
        // Saturday 2024-05-04 and Sunday 2024-05-05, spread over the day.
        let mut ts = Vec::new();
        for hour in 0..24 {
            ts.push(at(4, hour, 0));
            ts.push(at(5, hour, 0));
        }
        ts.push(at(1, 12, 0));
        let p = cyclical_pattern(&ts);
        assert_eq!(p.pattern_type, PatternType::Weekend);
        assert_eq!(p.weekday_distribution[6], 24);
        assert_eq!(p.weekday_distribution[0], 24);
    }

    #[test]
    fn test_uniform_and_empty() {
        let ts: Vec<_> = (0..24).map(|h| at(1, h, 0)).collect();
        let p = cyclical_pattern(&ts);
        assert_eq!(p.pattern_type, PatternType::Uniform);
        assert!(p.peak_hours.is_empty());
        assert_eq!(p.strength, 0.0);

        let empty = cyclical_pattern(&[]);
        assert_eq!(empty.pattern_type, PatternType::Uniform);
        assert_eq!(empty.strength, 0.0);
    }
}
