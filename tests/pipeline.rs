//! End-to-end runs against a real SQLite database: ingest, baselines,
//! anomaly scan, cascades, patterns, similarity and correlation.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use faultline::analysis::baseline::{BaselineCalculator, Granularity};
use faultline::analysis::cascade::CascadeDetector;
use faultline::analysis::correlation::CorrelationEngine;
use faultline::analysis::patterns::{BurstIntensity, PatternDetector};
use faultline::config::{AnomalyConfig, BurstConfig, CascadeConfig};
use faultline::detect::alert::{AlertSink, AnomalyAlert, LogSink, OutboxSink};
use faultline::detect::engine::AnomalyEngine;
use faultline::detect::throttle::AlertThrottler;
use faultline::detect::{AnomalyLevel, DetectError};
use faultline::occurrence::{ErrorKey, IdentityId, NewOccurrence};
use faultline::similarity::SimilarityScorer;
use faultline::storage::{
    open_pool, outbox, BaselineRepository, CascadeRepository, Pool, SqliteStore, StoreError,
};
use tempfile::TempDir;

fn setup() -> (TempDir, Pool, SqliteStore) {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(dir.path().join("faultline.db").to_str().unwrap()).unwrap();
    let store = SqliteStore::new(pool.clone());
    (dir, pool, store)
}

/// Monday, 12:30 UTC.
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 12, 30, 0).unwrap()
}

fn record(store: &SqliteStore, error_type: &str, platform: &str, message: &str, at: DateTime<Utc>) -> IdentityId {
    record_with(store, error_type, platform, message, &["/srv/shop/app/services/payment.rb:12:in `charge'"], at)
}

fn record_with(
    store: &SqliteStore,
    error_type: &str,
    platform: &str,
    message: &str,
    backtrace: &[&str],
    at: DateTime<Utc>,
) -> IdentityId {
    store
        .record_occurrence(&NewOccurrence {
            error_type: error_type.to_string(),
            platform: platform.to_string(),
            message: Some(message.to_string()),
            backtrace: Some(backtrace.iter().map(|s| s.to_string()).collect()),
            occurred_at: at,
        })
        .unwrap()
        .error_identity_id
}

/// 48 past hours alternating 4 and 6 occurrences: hourly mean 5, std dev 1.
fn seed_history(store: &SqliteStore, error_type: &str, platform: &str) {
    for h in 2..50 {
        let n = if h % 2 == 0 { 4 } else { 6 };
        for j in 0..n {
            let at = now() - Duration::hours(h) + Duration::minutes(j);
            record(store, error_type, platform, "gateway timed out after 3000ms", at);
        }
    }
}

fn spike(store: &SqliteStore, error_type: &str, platform: &str, count: i64) {
    for i in 0..count {
        let at = now() - Duration::minutes(30) + Duration::seconds(60 * i);
        record(store, error_type, platform, "gateway timed out after 3000ms", at);
    }
}

#[test]
fn test_spike_raises_one_alert_then_throttles() {
    let (_dir, pool, store) = setup();
    seed_history(&store, "Timeout", "web");
    seed_history(&store, "KeyError", "ios");

    let report = BaselineCalculator::new(store.clone()).calculate_all(now()).unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);

    let hourly = store
        .fetch_baselines(&ErrorKey::new("Timeout", "web"))
        .unwrap()
        .hourly
        .unwrap();
    assert!((hourly.stats.mean - 5.0).abs() < 1e-9);
    assert!((hourly.stats.std_dev - 1.0).abs() < 1e-9);
    assert_eq!(hourly.stats.sample_size, 48);

    spike(&store, "Timeout", "web", 20);
    spike(&store, "KeyError", "ios", 5);

    let engine = AnomalyEngine::new(
        store.clone(),
        OutboxSink::new(pool.clone()),
        Arc::new(AlertThrottler::new()),
        AnomalyConfig::default(),
    );
    let first = engine.run_scan(now()).unwrap();
    assert_eq!(first.keys_scanned, 2);
    assert_eq!(first.anomalies, 1);
    assert_eq!(first.alerts_sent, 1);
    assert_eq!(first.failed, 0);

    let conn = pool.get().unwrap();
    let pending = outbox::pending(&conn, 10).unwrap();
    assert_eq!(pending.len(), 1);
    let alert = &pending[0];
    assert_eq!((alert.error_type.as_str(), alert.platform.as_str()), ("Timeout", "web"));
    assert_eq!(alert.current_count, 20);
    assert_eq!(alert.result.level, Some(AnomalyLevel::Critical));
    assert_eq!(alert.result.baseline_type, Some(Granularity::Hourly));
    assert!(alert.identity_id.is_some());

    let second = engine.run_scan(now() + Duration::minutes(5)).unwrap();
    assert_eq!(second.anomalies, 1);
    assert_eq!(second.throttled, 1);
    assert_eq!(second.alerts_sent, 0);
    assert_eq!(outbox::pending(&conn, 10).unwrap().len(), 1);
}

struct FailingSink;

impl AlertSink for FailingSink {
    fn dispatch(&self, _alert: &AnomalyAlert) -> Result<(), DetectError> {
        Err(StoreError::Invalid("notifier unavailable".to_string()).into())
    }
}

#[test]
fn test_failed_dispatch_is_counted_and_not_throttled() {
    let (_dir, _pool, store) = setup();
    seed_history(&store, "Timeout", "web");
    BaselineCalculator::new(store.clone()).calculate_all(now()).unwrap();
    spike(&store, "Timeout", "web", 20);

    let throttler = Arc::new(AlertThrottler::new());
    let engine = AnomalyEngine::new(
        store.clone(),
        FailingSink,
        Arc::clone(&throttler),
        AnomalyConfig::default(),
    );
    let summary = engine.run_scan(now()).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.alerts_sent, 0);
    assert!(throttler.is_empty());

    // The next scan with a working sink still alerts.
    let engine = AnomalyEngine::new(store, LogSink, throttler, AnomalyConfig::default());
    assert_eq!(engine.run_scan(now()).unwrap().alerts_sent, 1);
}

#[test]
fn test_sparse_history_still_catches_spike() {
    let (_dir, pool, store) = setup();
    // One occurrence every six hours for two weeks.
    for k in 1..=56 {
        record(&store, "CacheMiss", "web", "cache miss", now() - Duration::hours(6 * k));
    }
    BaselineCalculator::new(store.clone()).calculate_all(now()).unwrap();

    let hourly = store
        .fetch_baselines(&ErrorKey::new("CacheMiss", "web"))
        .unwrap()
        .hourly
        .unwrap();
    // Quiet hours count as zero, from the first sighting on.
    assert_eq!(hourly.stats.sample_size, 336);
    assert!((hourly.stats.mean - 1.0 / 6.0).abs() < 1e-9);
    assert!(hourly.stats.std_dev > 0.3);

    for i in 0..200 {
        record(&store, "CacheMiss", "web", "cache miss", now() - Duration::minutes(30) + Duration::seconds(9 * i));
    }
    let engine = AnomalyEngine::new(
        store,
        OutboxSink::new(pool),
        Arc::new(AlertThrottler::new()),
        AnomalyConfig::default(),
    );
    let summary = engine.run_scan(now()).unwrap();
    assert_eq!(summary.anomalies, 1);
    assert_eq!(summary.alerts_sent, 1);
}

#[test]
fn test_scan_without_baselines_is_quiet() {
    let (_dir, pool, store) = setup();
    spike(&store, "Timeout", "web", 50);
    let engine = AnomalyEngine::new(
        store,
        OutboxSink::new(pool),
        Arc::new(AlertThrottler::new()),
        AnomalyConfig::default(),
    );
    let summary = engine.run_scan(now()).unwrap();
    assert_eq!(summary.keys_scanned, 1);
    assert_eq!(summary.anomalies, 0);
}

#[test]
fn test_cascade_detected_and_reinforced() {
    let (_dir, _pool, store) = setup();
    let start = now() - Duration::hours(3);
    let mut parent = IdentityId(0);
    let mut child = IdentityId(0);
    for i in 0..3 {
        let at = start + Duration::minutes(10 * i);
        parent = record(&store, "DbTimeout", "web", "database timed out", at);
        child = record(&store, "ApiError", "web", "upstream failed", at + Duration::seconds(30));
    }
    // A parent occurrence nothing follows.
    record(&store, "DbTimeout", "web", "database timed out", start + Duration::minutes(40));

    let detector = CascadeDetector::new(store.clone(), CascadeConfig::default());
    let summary = detector.detect_cascades(24, now()).unwrap();
    assert_eq!(summary.detected, 1);
    assert_eq!(summary.updated, 0);

    let pattern = store.fetch_cascade_pattern(parent, child).unwrap().unwrap();
    assert_eq!(pattern.frequency, 3);
    assert!((pattern.avg_delay_seconds - 30.0).abs() < 1e-9);
    assert_eq!(pattern.cascade_probability, Some(0.75));
    assert!(store.fetch_cascade_pattern(child, parent).unwrap().is_none());

    // Overlapping lookbacks see the same instances and leave the pattern alone.
    for minutes in [0, 15, 30, 45] {
        let again = detector.detect_cascades(24, now() + Duration::minutes(minutes)).unwrap();
        assert_eq!((again.detected, again.updated), (0, 0));
    }
    let pattern = store.fetch_cascade_pattern(parent, child).unwrap().unwrap();
    assert_eq!(pattern.frequency, 3);
    assert_eq!(pattern.cascade_probability, Some(0.75));

    // More parents without children lower the probability, frequency stays.
    record(&store, "DbTimeout", "web", "database timed out", start + Duration::minutes(50));
    detector.detect_cascades(24, now() + Duration::hours(1)).unwrap();
    let pattern = store.fetch_cascade_pattern(parent, child).unwrap().unwrap();
    assert_eq!(pattern.frequency, 3);
    assert_eq!(pattern.cascade_probability, Some(0.6));

    assert_eq!(store.list_cascade_patterns(10).unwrap().len(), 1);
}

#[test]
fn test_cascade_absorbs_only_new_instances() {
    let (_dir, _pool, store) = setup();
    let start = now() - Duration::hours(3);
    let mut parent = IdentityId(0);
    let mut child = IdentityId(0);
    for i in 0..3 {
        let at = start + Duration::minutes(10 * i);
        parent = record(&store, "DbTimeout", "web", "database timed out", at);
        child = record(&store, "ApiError", "web", "upstream failed", at + Duration::seconds(30));
    }
    let detector = CascadeDetector::new(store.clone(), CascadeConfig::default());
    assert_eq!(detector.detect_cascades(24, now()).unwrap().detected, 1);

    let at = now() + Duration::minutes(10);
    record(&store, "DbTimeout", "web", "database timed out", at);
    record(&store, "ApiError", "web", "upstream failed", at + Duration::seconds(50));

    // The child is already in, but the parent's window is still open.
    let early = detector
        .detect_cascades(24, at + Duration::seconds(55))
        .unwrap();
    assert_eq!(early.updated, 0);
    assert_eq!(store.fetch_cascade_pattern(parent, child).unwrap().unwrap().frequency, 3);

    // A single new instance is enough for an existing pattern.
    let later = detector.detect_cascades(24, now() + Duration::minutes(20)).unwrap();
    assert_eq!(later.updated, 1);
    let pattern = store.fetch_cascade_pattern(parent, child).unwrap().unwrap();
    assert_eq!(pattern.frequency, 4);
    assert!((pattern.avg_delay_seconds - 35.0).abs() < 1e-9);
    assert_eq!(pattern.cascade_probability, Some(1.0));
    assert_eq!(pattern.last_detected_at, now() + Duration::minutes(20));

    detector.detect_cascades(24, now() + Duration::minutes(35)).unwrap();
    assert_eq!(store.fetch_cascade_pattern(parent, child).unwrap().unwrap().frequency, 4);
}

#[test]
fn test_cascade_rejects_out_of_range_lookback() {
    let (_dir, _pool, store) = setup();
    let detector = CascadeDetector::new(store, CascadeConfig::default());
    assert!(matches!(
        detector.detect_cascades(i64::MAX, now()),
        Err(DetectError::OutOfRange { what: "lookback_hours", .. })
    ));
}

#[test]
fn test_pattern_report_finds_burst() {
    let (_dir, _pool, store) = setup();
    let start = now() - Duration::hours(2);
    let mut identity = IdentityId(0);
    for i in 0..6 {
        identity = record(&store, "Timeout", "web", "timed out", start + Duration::seconds(10 * i));
    }

    let report = PatternDetector::new(store, BurstConfig::default())
        .analyze(identity, 30, now())
        .unwrap();
    assert_eq!(report.occurrences, 6);
    assert_eq!(report.bursts.len(), 1);
    assert_eq!(report.bursts[0].error_count, 6);
    assert_eq!(report.bursts[0].duration_seconds, 50);
    assert_eq!(report.bursts[0].intensity, BurstIntensity::Low);
}

#[test]
fn test_similar_identities_found() {
    let (_dir, _pool, store) = setup();
    let frames = [
        "/srv/shop/app/models/cart.rb:10:in `total'",
        "/srv/shop/app/services/checkout.rb:22:in `run'",
    ];
    let target = record_with(&store, "NoMethodError", "web", "undefined method `price' for nil", &frames, now());
    let twin = record_with(&store, "NoMethodError", "web", "undefined method `cost' for nil", &frames, now());
    record_with(&store, "NoMethodError", "ios", "undefined method `cost' for nil", &frames, now());
    assert_ne!(target, twin);

    let scorer = SimilarityScorer::default();
    let matches = scorer.find_similar(&store, target, 0.8, 10).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].identity_id, twin);
    assert!((matches[0].score - 1.0).abs() < 1e-9);

    assert!(scorer.find_similar(&store, IdentityId(9999), 0.8, 10).unwrap().is_empty());
}

#[test]
fn test_correlated_identities() {
    let (_dir, _pool, store) = setup();
    let a_counts = [1, 5, 2, 8, 1, 6, 3, 7];
    let c_counts = [8, 1, 6, 1, 9, 2, 7, 1];
    let (mut a, mut b) = (IdentityId(0), IdentityId(0));
    for (h, (&na, &nc)) in a_counts.iter().zip(c_counts.iter()).enumerate() {
        let hour = now() - Duration::hours(10 - h as i64);
        for j in 0..na {
            a = record(&store, "A", "web", "a", hour + Duration::minutes(j));
            // B moves with A at twice the rate.
            for s in 0..2 {
                b = record(&store, "B", "web", "b", hour + Duration::minutes(j) + Duration::seconds(s));
            }
        }
        for j in 0..nc {
            record(&store, "C", "web", "c", hour + Duration::minutes(j));
        }
    }

    let pairs = CorrelationEngine::new(store)
        .correlate(now() - Duration::hours(24), 0.7)
        .unwrap();
    assert_eq!(pairs.len(), 1);
    let ids = [pairs[0].identity_a, pairs[0].identity_b];
    assert!(ids.contains(&a) && ids.contains(&b));
    assert!((pairs[0].correlation - 1.0).abs() < 1e-9);
}
