//! Fuzzy similarity between error occurrences.
//!
//! The score blends stack-trace overlap (Jaccard over application frames)
//! with message closeness (normalized Levenshtein). Stack traces dominate the
//! blend: two errors thrown from the same code path are near-duplicates even
//! when their messages differ in detail.

pub mod distance;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::fingerprint::FrameFilter;
use crate::occurrence::{IdentityId, Occurrence};
use crate::storage::{OccurrenceRepository, StoreResult};

pub use self::distance::{jaccard, levenshtein};

/// Frames considered per side for backtrace similarity.
pub const COMPARED_FRAMES: usize = 20;
pub const BACKTRACE_WEIGHT: f64 = 0.7;
pub const MESSAGE_WEIGHT: f64 = 0.3;
/// Upper bound on stored candidates scored per lookup.
pub const CANDIDATE_LIMIT: usize = 100;

/// Comparison-only canonicalization, applied after lower-casing.
static CANONICAL: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"#<[^>]*>", "<obj>"),
        (r#""[^"]*""#, "<str>"),
        (r"`[^`']*'", "<str>"),
        (r"'[^'\s]*'", "<str>"),
        (r"\b0x[0-9a-f]+\b", "<hex>"),
        (r"\d+", "<n>"),
    ]
    .iter()
    .map(|(p, t)| {
        let re = Regex::new(p).unwrap_or_else(|e| panic!("canonical pattern {p}: {e}"));
        (re, *t)
    })
    .collect()
});

fn canonical_message(message: &str) -> String {
    CANONICAL
        .iter()
        .fold(message.to_lowercase(), |acc, (re, token)| {
            re.replace_all(&acc, *token).into_owned()
        })
}

/// `1 - lev / max_len` over canonicalized messages; two empty messages are
/// identical.
pub fn message_similarity(a: &str, b: &str) -> f64 {
    let a = canonical_message(a);
    let b = canonical_message(b);
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// A scored candidate.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarMatch {
    pub identity_id: IdentityId,
    pub score: f64,
}

/// Pairwise scorer; owns the frame filter used to pick comparable frames.
#[derive(Debug, Clone, Default)]
pub struct SimilarityScorer {
    filter: FrameFilter,
}

impl SimilarityScorer {
    pub fn new(filter: FrameFilter) -> Self {
        Self { filter }
    }

    /// Jaccard over the leading application frames of both backtraces.
    pub fn backtrace_similarity(&self, a: &[String], b: &[String]) -> f64 {
        let fa = self.filter.significant_frames(a, COMPARED_FRAMES).unwrap_or_default();
        let fb = self.filter.significant_frames(b, COMPARED_FRAMES).unwrap_or_default();
        jaccard(&fa, &fb)
    }

    /// Similarity in `[0, 1]`. Occurrences of one identity score 1; occurrences
    /// from different platforms score 0.
    pub fn score(&self, a: &Occurrence, b: &Occurrence) -> f64 {
        if a.error_identity_id == b.error_identity_id {
            return 1.0;
        }
        if a.platform != b.platform {
            return 0.0;
        }

        let backtrace = self.backtrace_similarity(&a.backtrace, &b.backtrace);
        let message = message_similarity(&a.message, &b.message);
        (BACKTRACE_WEIGHT * backtrace + MESSAGE_WEIGHT * message).clamp(0.0, 1.0)
    }

    /// Score `candidates` against `target`, keep those at or above `threshold`,
    /// best first. Candidates of the target's own identity are skipped.
    pub fn rank_similar(
        &self,
        target: &Occurrence,
        candidates: &[Occurrence],
        threshold: f64,
        limit: usize,
    ) -> Vec<SimilarMatch> {
        let mut best: HashMap<IdentityId, f64> = HashMap::new();
        for c in candidates {
            if c.error_identity_id == target.error_identity_id {
                continue;
            }
            let score = self.score(target, c);
            if score < threshold {
                continue;
            }
            let entry = best.entry(c.error_identity_id).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }

        let mut matches: Vec<SimilarMatch> = best
            .into_iter()
            .map(|(identity_id, score)| SimilarMatch { identity_id, score })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.identity_id.cmp(&b.identity_id))
        });
        matches.truncate(limit);
        matches
    }

    /// Identities whose latest occurrence resembles the latest occurrence of
    /// `identity`. Empty when the identity has no occurrences.
    pub fn find_similar<S: OccurrenceRepository>(
        &self,
        store: &S,
        identity: IdentityId,
        threshold: f64,
        limit: usize,
    ) -> StoreResult<Vec<SimilarMatch>> {
        let Some(target) = store.latest_occurrence(identity)? else {
            return Ok(Vec::new());
        };
        let candidates = store.similarity_candidates(identity, CANDIDATE_LIMIT)?;
        let matches = self.rank_similar(&target, &candidates, threshold, limit);
        tracing::debug!(
            %identity,
            candidates = candidates.len(),
            matches = matches.len(),
            "similarity lookup"
        );
        Ok(matches)
    }
}

/// [`SimilarityScorer::score`] with the default frame filter.
pub fn similarity(a: &Occurrence, b: &Occurrence) -> f64 {
    SimilarityScorer::default().score(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn occ(id: i64, platform: &str, message: &str, frames: &[&str]) -> Occurrence {
        Occurrence {
            error_type: "NoMethodError".to_string(),
            platform: platform.to_string(),
            message: message.to_string(),
            backtrace: frames.iter().map(|s| s.to_string()).collect(),
            occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            error_identity_id: IdentityId(id),
        }
    }

    const SHARED: [&str; 3] = [
        "/srv/app/models/cart.rb:10:in `total'",
        "/srv/app/services/checkout.rb:22:in `run'",
        "/srv/app/controllers/carts_controller.rb:5:in `show'",
    ];

    #[test]
    fn test_reflexive() {
        let a = occ(1, "ios", "boom", &SHARED);
        assert_eq!(similarity(&a, &a), 1.0);
    }

    #[test]
    fn test_cross_platform_is_zero() {
        let a = occ(1, "ios", "undefined method `price' for nil", &SHARED);
        let b = occ(2, "android", "undefined method `price' for nil", &SHARED);
        assert_eq!(similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_symmetric() {
        let a = occ(1, "web", "undefined method `price' for nil", &SHARED);
        let b = occ(
            2,
            "web",
            "undefined method `cost' for nil",
            &[SHARED[0], "/srv/app/jobs/sync.rb:1:in `perform'"],
        );
        let ab = similarity(&a, &b);
        let ba = similarity(&b, &a);
        assert!((ab - ba).abs() < 1e-12);
        assert!(ab > 0.0 && ab < 1.0);
    }

    #[test]
    fn test_same_frames_and_canonically_equal_messages_score_one() {
        let a = occ(1, "web", "Order 1234 failed with \"card_declined\"", &SHARED);
        let b = occ(2, "web", "order 98 failed with \"insufficient_funds\"", &SHARED);
        assert!((similarity(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_weights() {
        // Identical frames, completely different same-length messages.
        let a = occ(1, "web", "aaaa", &SHARED);
        let b = occ(2, "web", "bbbb", &SHARED);
        assert!((similarity(&a, &b) - 0.7).abs() < 1e-12);

        // No frames at all, identical messages.
        let c = occ(3, "web", "timeout", &[]);
        let d = occ(4, "web", "timeout", &[]);
        assert!((similarity(&c, &d) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_message_similarity_canonicalization() {
        assert_eq!(message_similarity("Timeout after 30s", "timeout after 45s"), 1.0);
        assert_eq!(
            message_similarity("#<User:0x000abc> invalid", "#<Admin:0x111def> invalid"),
            1.0
        );
        assert_eq!(message_similarity("", ""), 1.0);
    }

    #[test]
    fn test_rank_similar_orders_and_filters() {
        let scorer = SimilarityScorer::default();
        let target = occ(1, "web", "undefined method `price' for nil", &SHARED);
        let candidates = vec![
            occ(1, "web", "same identity", &SHARED),
            occ(2, "web", "undefined method `price' for nil", &SHARED),
            occ(3, "web", "completely unrelated failure text", &[]),
            occ(4, "android", "undefined method `price' for nil", &SHARED),
            occ(5, "web", "undefined method `cost' for nil", &SHARED[..2]),
        ];

        let ranked = scorer.rank_similar(&target, &candidates, 0.5, 10);
        let ids: Vec<i64> = ranked.iter().map(|m| m.identity_id.0).collect();
        assert_eq!(ids, vec![2, 5]);
        assert!(ranked[0].score >= ranked[1].score);

        let top = scorer.rank_similar(&target, &candidates, 0.0, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].identity_id, IdentityId(2));
    }
}
