//! Co-occurrence correlation between error identities.
//!
//! Two identities whose hourly counts rise and fall together are often two
//! symptoms of one failure. Unlike cascades this carries no ordering.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::analysis::stats::TimeSeries;
use crate::detect::DetectError;
use crate::occurrence::IdentityId;
use crate::storage::{IdentityBucketCount, OccurrenceRepository};

/// Identities need at least this many non-empty hours to be correlated.
pub const MIN_ACTIVE_BUCKETS: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelatedPair {
    pub identity_a: IdentityId,
    pub identity_b: IdentityId,
    pub correlation: f64,
}

/// Group bucket rows into one sparse series per identity.
pub fn series_from_buckets(rows: &[IdentityBucketCount]) -> BTreeMap<IdentityId, BTreeMap<i64, u64>> {
    let mut series: BTreeMap<IdentityId, BTreeMap<i64, u64>> = BTreeMap::new();
    for row in rows {
        *series
            .entry(row.identity_id)
            .or_default()
            .entry(row.bucket)
            .or_default() += row.count;
    }
    series
}

/// Pearson correlation of every pair of qualifying identities.
///
/// All series are laid over the union of their buckets, missing buckets
/// counting as zero. Pairs are reported when `r >= min_correlation`, highest
/// first.
pub fn correlate_identities(
    series: &BTreeMap<IdentityId, BTreeMap<i64, u64>>,
    min_buckets: usize,
    min_correlation: f64,
) -> Vec<CorrelatedPair> {
    let axis: BTreeSet<i64> = series.values().flat_map(|s| s.keys().copied()).collect();

    let dense: Vec<(IdentityId, TimeSeries)> = series
        .iter()
        .filter(|(_, buckets)| buckets.values().filter(|c| **c > 0).count() >= min_buckets)
        .map(|(id, buckets)| {
            let values = axis
                .iter()
                .map(|b| buckets.get(b).copied().unwrap_or(0) as f64)
                .collect();
            (*id, TimeSeries::new(values))
        })
        .collect();

    let mut pairs = Vec::new();
    for (i, (id_a, a)) in dense.iter().enumerate() {
        for (id_b, b) in &dense[i + 1..] {
            if let Some(r) = a.pearson(b) {
                if r >= min_correlation {
                    pairs.push(CorrelatedPair {
                        identity_a: *id_a,
                        identity_b: *id_b,
                        correlation: r,
                    });
                }
            }
        }
    }
    pairs.sort_by(|x, y| {
        y.correlation
            .total_cmp(&x.correlation)
            .then_with(|| (x.identity_a, x.identity_b).cmp(&(y.identity_a, y.identity_b)))
    });
    pairs
}

pub struct CorrelationEngine<S> {
    store: S,
}

impl<S: OccurrenceRepository> CorrelationEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Correlate every identity active since `since`.
    pub fn correlate(
        &self,
        since: DateTime<Utc>,
        min_correlation: f64,
    ) -> Result<Vec<CorrelatedPair>, DetectError> {
        let rows = self.store.hourly_identity_counts(since)?;
        let series = series_from_buckets(&rows);
        let pairs = correlate_identities(&series, MIN_ACTIVE_BUCKETS, min_correlation);
        debug!(identities = series.len(), pairs = pairs.len(), "correlation finished");
        Ok(pairs)
    }
}
