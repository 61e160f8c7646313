use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AnomalyConfig;
use crate::detect::alert::{AlertSink, AnomalyAlert};
use crate::detect::anomaly::evaluate;
use crate::detect::throttle::AlertThrottler;
use crate::detect::DetectError;
use crate::storage::{BaselineRepository, KeyCount, OccurrenceRepository};

/// Counts in this trailing window are compared against the baselines.
pub const SCAN_WINDOW_MINUTES: i64 = 60;

/// Outcome of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub keys_scanned: usize,
    pub anomalies: usize,
    pub alerts_sent: usize,
    pub throttled: usize,
    pub failed: usize,
}

enum KeyOutcome {
    Normal,
    Throttled,
    Alerted,
}

/// Compares recent counts with their baselines and raises throttled alerts.
pub struct AnomalyEngine<S, K> {
    store: S,
    sink: K,
    throttler: Arc<AlertThrottler>,
    config: AnomalyConfig,
}

impl<S, K> AnomalyEngine<S, K>
where
    S: OccurrenceRepository + BaselineRepository,
    K: AlertSink,
{
    pub fn new(store: S, sink: K, throttler: Arc<AlertThrottler>, config: AnomalyConfig) -> Self {
        Self {
            store,
            sink,
            throttler,
            config,
        }
    }

    pub fn throttler(&self) -> &Arc<AlertThrottler> {
        &self.throttler
    }

    /// Evaluate every key with occurrences in the trailing hour.
    ///
    /// A key whose baselines cannot be read or whose alert cannot be
    /// delivered is logged and counted as failed; the scan goes on.
    pub fn run_scan(&self, now: DateTime<Utc>) -> Result<ScanSummary, DetectError> {
        info!("Running anomaly detection scan");
        let since = now - Duration::minutes(SCAN_WINDOW_MINUTES);
        let counts = self.store.recent_key_counts(since)?;

        let mut summary = ScanSummary {
            keys_scanned: counts.len(),
            ..Default::default()
        };
        for kc in &counts {
            match self.check_key(kc, now) {
                Ok(KeyOutcome::Normal) => {}
                Ok(KeyOutcome::Throttled) => {
                    summary.anomalies += 1;
                    summary.throttled += 1;
                }
                Ok(KeyOutcome::Alerted) => {
                    summary.anomalies += 1;
                    summary.alerts_sent += 1;
                }
                Err(e) => {
                    warn!(key = %kc.key, error = %e, "anomaly check failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            keys = summary.keys_scanned,
            anomalies = summary.anomalies,
            alerts = summary.alerts_sent,
            throttled = summary.throttled,
            failed = summary.failed,
            "anomaly scan finished"
        );
        Ok(summary)
    }

    fn check_key(&self, kc: &KeyCount, now: DateTime<Utc>) -> Result<KeyOutcome, DetectError> {
        let baselines = self.store.fetch_baselines(&kc.key)?;
        let result = evaluate(kc.count, &baselines, self.config.sensitivity);
        if !result.is_anomaly {
            debug!(key = %kc.key, count = kc.count, reason = %result.reason, "no anomaly");
            return Ok(KeyOutcome::Normal);
        }

        let (error_type, platform) = (&kc.key.error_type, &kc.key.platform);
        if !self
            .throttler
            .should_alert_at(error_type, platform, self.config.cooldown(), now)
        {
            debug!(key = %kc.key, "anomaly throttled");
            return Ok(KeyOutcome::Throttled);
        }

        let alert = AnomalyAlert::new(&kc.key, kc.latest_identity, kc.count, result, now);
        self.sink.dispatch(&alert)?;
        self.throttler.record_alert_at(error_type, platform, now);
        Ok(KeyOutcome::Alerted)
    }
}
