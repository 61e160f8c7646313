//! Anomaly detection, alert throttling and alert delivery.

pub mod alert;
pub mod anomaly;
pub mod engine;
pub mod throttle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::baseline::Granularity;
use crate::occurrence::IdentityId;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("identity {0} cannot cascade into itself")]
    SelfCascade(IdentityId),
    #[error("invalid cascade pattern: {0}")]
    InvalidCascade(String),
    #[error("invalid baseline period: {start} .. {end}")]
    InvalidPeriod {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("invalid baseline standard deviation: {0}")]
    InvalidStdDev(f64),
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Severity of an anomalous count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyLevel {
    Elevated,
    High,
    Critical,
}

impl std::fmt::Display for AnomalyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AnomalyLevel::Elevated => "elevated",
            AnomalyLevel::High => "high",
            AnomalyLevel::Critical => "critical",
        })
    }
}

/// Verdict on one current count. Transient, never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub level: Option<AnomalyLevel>,
    /// Granularity of the baseline the count was compared against.
    pub baseline_type: Option<Granularity>,
    /// `mean + sensitivity * std_dev` of that baseline.
    pub threshold: Option<f64>,
    /// `None` when there is no baseline or it has zero spread.
    pub std_devs_above: Option<f64>,
    pub reason: String,
}
