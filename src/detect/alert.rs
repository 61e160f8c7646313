//! Anomaly alerts and where they go.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::detect::{AnomalyResult, DetectError};
use crate::occurrence::{ErrorKey, IdentityId};
use crate::storage::{outbox, Pool, StoreError};

/// An anomalous count that passed the throttler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub id: Uuid,
    pub error_type: String,
    pub platform: String,
    /// Identity of the most recent occurrence behind the spike, if known.
    pub identity_id: Option<IdentityId>,
    pub current_count: u64,
    pub result: AnomalyResult,
    pub raised_at: DateTime<Utc>,
}

impl AnomalyAlert {
    pub fn new(
        key: &ErrorKey,
        identity_id: Option<IdentityId>,
        current_count: u64,
        result: AnomalyResult,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_type: key.error_type.clone(),
            platform: key.platform.clone(),
            identity_id,
            current_count,
            result,
            raised_at,
        }
    }
}

/// Hands alerts to whatever delivers them. Formatting and transport are the
/// sink's business.
pub trait AlertSink {
    fn dispatch(&self, alert: &AnomalyAlert) -> Result<(), DetectError>;
}

/// Writes alerts to the SQLite outbox for an external notifier to drain.
#[derive(Clone)]
pub struct OutboxSink {
    pool: Pool,
}

impl OutboxSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl AlertSink for OutboxSink {
    fn dispatch(&self, alert: &AnomalyAlert) -> Result<(), DetectError> {
        let conn = self.pool.get().map_err(StoreError::from)?;
        outbox::enqueue(&conn, alert)?;
        info!(
            id = %alert.id,
            error_type = %alert.error_type,
            platform = %alert.platform,
            level = ?alert.result.level,
            "alert queued"
        );
        Ok(())
    }
}

/// Logs alerts and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn dispatch(&self, alert: &AnomalyAlert) -> Result<(), DetectError> {
        warn!(
            error_type = %alert.error_type,
            platform = %alert.platform,
            count = alert.current_count,
            level = ?alert.result.level,
            std_devs_above = ?alert.result.std_devs_above,
            "{}",
            alert.result.reason
        );
        Ok(())
    }
}
