//! Rolling occurrence baselines per (error_type, platform).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::runner::{run_keyed, BatchReport, InFlight};
use crate::analysis::stats::{compute_baseline, BaselineStats};
use crate::detect::DetectError;
use crate::occurrence::ErrorKey;
use crate::storage::{BaselineRepository, OccurrenceRepository};

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;
// 1970-01-01 was a Thursday; shifting by three days makes weeks start on Monday.
const WEEK_OFFSET_MS: i64 = 3 * DAY_MS;

/// Bucket size of a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
}

impl Granularity {
    /// All granularities, in evaluation preference order.
    pub const ALL: [Granularity; 3] = [Granularity::Hourly, Granularity::Daily, Granularity::Weekly];

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
        }
    }

    /// History window the baseline is learned from.
    pub fn lookback(self) -> Duration {
        match self {
            Granularity::Hourly => Duration::weeks(4),
            Granularity::Daily => Duration::weeks(12),
            Granularity::Weekly => Duration::days(365),
        }
    }

    pub fn bucket_ms(self) -> i64 {
        match self {
            Granularity::Hourly => HOUR_MS,
            Granularity::Daily => DAY_MS,
            Granularity::Weekly => 7 * DAY_MS,
        }
    }

    /// Added to a millisecond timestamp before dividing by [`Self::bucket_ms`].
    pub fn bucket_offset_ms(self) -> i64 {
        match self {
            Granularity::Weekly => WEEK_OFFSET_MS,
            _ => 0,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Granularity::Hourly),
            "daily" => Ok(Granularity::Daily),
            "weekly" => Ok(Granularity::Weekly),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

/// Learned profile of normal occurrence counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub error_type: String,
    pub platform: String,
    pub granularity: Granularity,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: BaselineStats,
}

impl Baseline {
    /// Build a baseline, rejecting empty periods and negative spread.
    pub fn new(
        key: &ErrorKey,
        granularity: Granularity,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        stats: BaselineStats,
    ) -> Result<Self, DetectError> {
        if period_end <= period_start {
            return Err(DetectError::InvalidPeriod {
                start: period_start,
                end: period_end,
            });
        }
        if stats.std_dev.is_nan() || stats.std_dev < 0.0 {
            return Err(DetectError::InvalidStdDev(stats.std_dev));
        }
        Ok(Self {
            error_type: key.error_type.clone(),
            platform: key.platform.clone(),
            granularity,
            period_start,
            period_end,
            stats,
        })
    }

    pub fn key(&self) -> ErrorKey {
        ErrorKey::new(&self.error_type, &self.platform)
    }
}

/// The current baselines of one key, at most one per granularity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BaselineSet {
    pub hourly: Option<Baseline>,
    pub daily: Option<Baseline>,
    pub weekly: Option<Baseline>,
}

impl BaselineSet {
    pub fn get(&self, granularity: Granularity) -> Option<&Baseline> {
        match granularity {
            Granularity::Hourly => self.hourly.as_ref(),
            Granularity::Daily => self.daily.as_ref(),
            Granularity::Weekly => self.weekly.as_ref(),
        }
    }

    pub fn insert(&mut self, baseline: Baseline) {
        let slot = match baseline.granularity {
            Granularity::Hourly => &mut self.hourly,
            Granularity::Daily => &mut self.daily,
            Granularity::Weekly => &mut self.weekly,
        };
        *slot = Some(baseline);
    }

    /// First present baseline in hourly, daily, weekly order.
    pub fn preferred(&self) -> Option<&Baseline> {
        Granularity::ALL.iter().find_map(|g| self.get(*g))
    }

    pub fn is_empty(&self) -> bool {
        self.preferred().is_none()
    }
}

/// Recomputes and stores baselines from occurrence history.
pub struct BaselineCalculator<S> {
    store: S,
    inflight: Arc<InFlight<ErrorKey>>,
}

impl<S> BaselineCalculator<S>
where
    S: OccurrenceRepository + BaselineRepository,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            inflight: Arc::new(InFlight::new()),
        }
    }

    /// Share an in-flight guard with other calculators working on the same
    /// store, so two of them never recompute one key at the same time.
    pub fn with_inflight(mut self, inflight: Arc<InFlight<ErrorKey>>) -> Self {
        self.inflight = inflight;
        self
    }

    /// Recompute every granularity for one key, replacing the stored rows.
    pub fn calculate(&self, key: &ErrorKey, now: DateTime<Utc>) -> Result<Vec<Baseline>, DetectError> {
        let mut out = Vec::with_capacity(Granularity::ALL.len());
        for granularity in Granularity::ALL {
            let since = now - granularity.lookback();
            let counts = self.store.fetch_occurrence_counts(key, granularity, since, now)?;
            let stats = compute_baseline(&counts);
            let baseline = Baseline::new(key, granularity, since, now, stats)?;
            self.store.upsert_baseline(&baseline)?;
            debug!(
                key = %key,
                %granularity,
                buckets = counts.len(),
                mean = stats.mean,
                std_dev = stats.std_dev,
                "baseline updated"
            );
            out.push(baseline);
        }
        Ok(out)
    }

    /// Recompute baselines for every key with occurrences. A failing key is
    /// logged and counted; the rest of the batch still runs.
    pub fn calculate_all(&self, now: DateTime<Utc>) -> Result<BatchReport, DetectError> {
        let keys = self.store.error_keys()?;
        let (report, _) = run_keyed("baselines", &self.inflight, keys, |key| {
            self.calculate(key, now)
        });
        Ok(report)
    }
}
