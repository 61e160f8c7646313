//! Cascade detection: error identities that reliably fire shortly after
//! another identity.
//!
//! Co-occurrence within a short window is evidence of a causal chain, not
//! proof; the stored probability is `frequency / parent occurrences`.
//!
//! Runs overlap in time, so each parent occurrence is counted once: a run
//! only takes parents whose window has closed, and an existing pattern only
//! absorbs parents that closed after its `last_detected_at`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysis::runner::{run_keyed, InFlight};
use crate::analysis::{lookback_from, span};
use crate::config::CascadeConfig;
use crate::detect::DetectError;
use crate::occurrence::{IdentityId, Occurrence};
use crate::storage::{CascadeRepository, OccurrenceRepository};

/// An ordered (parent, child) identity pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CascadePair {
    pub parent: IdentityId,
    pub child: IdentityId,
}

impl fmt::Display for CascadePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.parent, self.child)
    }
}

/// A stored follow-on relationship between two identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadePattern {
    pub parent_identity_id: IdentityId,
    pub child_identity_id: IdentityId,
    pub frequency: u64,
    pub avg_delay_seconds: f64,
    pub cascade_probability: Option<f64>,
    pub last_detected_at: DateTime<Utc>,
}

impl CascadePattern {
    /// A new pattern. Self-pairs, zero frequency and negative delays are
    /// rejected.
    pub fn new(
        parent: IdentityId,
        child: IdentityId,
        frequency: u64,
        avg_delay_seconds: f64,
        last_detected_at: DateTime<Utc>,
    ) -> Result<Self, DetectError> {
        if parent == child {
            return Err(DetectError::SelfCascade(parent));
        }
        if frequency == 0 {
            return Err(DetectError::InvalidCascade("frequency must be at least 1".into()));
        }
        if avg_delay_seconds.is_nan() || avg_delay_seconds < 0.0 {
            return Err(DetectError::InvalidCascade(format!(
                "negative average delay {avg_delay_seconds}"
            )));
        }
        Ok(Self {
            parent_identity_id: parent,
            child_identity_id: child,
            frequency,
            avg_delay_seconds,
            cascade_probability: None,
            last_detected_at,
        })
    }

    pub fn pair(&self) -> CascadePair {
        CascadePair {
            parent: self.parent_identity_id,
            child: self.child_identity_id,
        }
    }

    /// Fold newly observed delays into the running mean, one instance at a time.
    pub fn absorb(&mut self, delays: &[f64], detected_at: DateTime<Utc>) {
        for &delay in delays {
            let f = self.frequency as f64;
            self.avg_delay_seconds = (self.avg_delay_seconds * f + delay) / (f + 1.0);
            self.frequency += 1;
        }
        self.last_detected_at = detected_at;
    }

    /// Recompute `frequency / parent_total`, rounded to three decimals.
    /// `None` when the parent has no recorded occurrences.
    pub fn refresh_probability(&mut self, parent_total: u64) {
        self.cascade_probability = if parent_total == 0 {
            None
        } else {
            let p = self.frequency as f64 / parent_total as f64;
            Some((p * 1000.0).round() / 1000.0)
        };
    }
}

/// One parent occurrence and the delay to its first child.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FollowOn {
    pub parent_at: DateTime<Utc>,
    pub delay_seconds: f64,
}

/// For every occurrence taken as a parent, collect the delay to the first
/// later occurrence of each other identity within `window`.
///
/// Occurrences at the same instant as the parent are not considered
/// followers.
pub fn scan_pairs(occurrences: &[Occurrence], window: Duration) -> BTreeMap<CascadePair, Vec<FollowOn>> {
    let mut sorted: Vec<&Occurrence> = occurrences.iter().collect();
    sorted.sort_by_key(|o| o.occurred_at);

    let mut pairs: BTreeMap<CascadePair, Vec<FollowOn>> = BTreeMap::new();
    for (i, parent) in sorted.iter().enumerate() {
        let mut seen: HashSet<IdentityId> = HashSet::new();
        for child in &sorted[i + 1..] {
            let delay = child.occurred_at - parent.occurred_at;
            if delay > window {
                break;
            }
            if delay <= Duration::zero() || child.error_identity_id == parent.error_identity_id {
                continue;
            }
            if !seen.insert(child.error_identity_id) {
                continue;
            }
            let pair = CascadePair {
                parent: parent.error_identity_id,
                child: child.error_identity_id,
            };
            pairs.entry(pair).or_default().push(FollowOn {
                parent_at: parent.occurred_at,
                delay_seconds: delay.num_milliseconds() as f64 / 1000.0,
            });
        }
    }
    pairs
}

/// Outcome of one detection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CascadeSummary {
    /// New patterns created.
    pub detected: usize,
    /// Existing patterns updated.
    pub updated: usize,
    /// Pairs whose storage round-trip failed.
    pub failed: usize,
    /// Pairs skipped because another run held them.
    pub skipped: usize,
}

enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Runs cascade detection against a store.
pub struct CascadeDetector<S> {
    store: S,
    config: CascadeConfig,
    inflight: Arc<InFlight<CascadePair>>,
}

impl<S> CascadeDetector<S>
where
    S: OccurrenceRepository + CascadeRepository,
{
    pub fn new(store: S, config: CascadeConfig) -> Self {
        Self {
            store,
            config,
            inflight: Arc::new(InFlight::new()),
        }
    }

    pub fn with_inflight(mut self, inflight: Arc<InFlight<CascadePair>>) -> Self {
        self.inflight = inflight;
        self
    }

    /// Scan the trailing `lookback_hours`. New pairs are stored once seen
    /// at least `min_frequency` times; stored pairs absorb every parent not
    /// counted by an earlier run.
    pub fn detect_cascades(
        &self,
        lookback_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<CascadeSummary, DetectError> {
        let start = lookback_from(now, lookback_hours, Duration::try_hours, "lookback_hours")?;
        let window = span(self.config.window_seconds, Duration::try_seconds, "window_seconds")?;
        // Parents after this may still gain children later than `now`.
        let settled = now
            .checked_sub_signed(window)
            .ok_or(DetectError::OutOfRange {
                what: "window_seconds",
                value: self.config.window_seconds,
            })?;
        let occurrences = self.store.fetch_occurrences_in_window(start, now)?;

        let follow_ons: BTreeMap<CascadePair, Vec<FollowOn>> = scan_pairs(&occurrences, window)
            .into_iter()
            .filter_map(|(pair, mut found)| {
                found.retain(|f| f.parent_at <= settled);
                (!found.is_empty()).then_some((pair, found))
            })
            .collect();
        debug!(
            occurrences = occurrences.len(),
            candidates = follow_ons.len(),
            "cascade scan complete"
        );

        let (report, outcomes) = run_keyed(
            "cascades",
            &self.inflight,
            follow_ons.keys().copied(),
            |pair| self.apply_pair(*pair, &follow_ons[pair], window, now),
        );

        let mut summary = CascadeSummary {
            failed: report.failed,
            skipped: report.skipped,
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Applied::Created => summary.detected += 1,
                Applied::Updated => summary.updated += 1,
                Applied::Unchanged => {}
            }
        }
        info!(
            detected = summary.detected,
            updated = summary.updated,
            failed = summary.failed,
            "cascade detection finished"
        );
        Ok(summary)
    }

    fn apply_pair(
        &self,
        pair: CascadePair,
        found: &[FollowOn],
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Applied, DetectError> {
        let (mut pattern, applied) = match self.store.fetch_cascade_pattern(pair.parent, pair.child)? {
            Some(mut existing) => {
                // The run that stored `existing` counted every parent up to here.
                let counted_until = existing
                    .last_detected_at
                    .checked_sub_signed(window)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let fresh: Vec<f64> = found
                    .iter()
                    .filter(|f| f.parent_at > counted_until)
                    .map(|f| f.delay_seconds)
                    .collect();
                if fresh.is_empty() {
                    let before = existing.cascade_probability;
                    existing.refresh_probability(self.store.parent_occurrence_count(pair.parent)?);
                    if existing.cascade_probability != before {
                        self.store.upsert_cascade_pattern(&existing)?;
                    }
                    return Ok(Applied::Unchanged);
                }
                existing.absorb(&fresh, now);
                (existing, Applied::Updated)
            }
            None if (found.len() as u64) < self.config.min_frequency => return Ok(Applied::Unchanged),
            None => {
                let avg = found.iter().map(|f| f.delay_seconds).sum::<f64>() / found.len() as f64;
                let created = CascadePattern::new(pair.parent, pair.child, found.len() as u64, avg, now)?;
                (created, Applied::Created)
            }
        };

        let parent_total = self.store.parent_occurrence_count(pair.parent)?;
        pattern.refresh_probability(parent_total);
        self.store.upsert_cascade_pattern(&pattern)?;
        debug!(
            %pair,
            frequency = pattern.frequency,
            avg_delay_seconds = pattern.avg_delay_seconds,
            probability = ?pattern.cascade_probability,
            "cascade pattern stored"
        );
        Ok(applied)
    }
}
