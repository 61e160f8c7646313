//! Per-key alert rate limiting.
//!
//! The [`AlertThrottler`] remembers when each (error_type, platform) last
//! raised an alert and suppresses repeats inside the cooldown. All access to
//! the timestamp map goes through one mutex; callers must not hold it across
//! storage or notification calls, which is why checking and recording are two
//! separate steps.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::occurrence::ErrorKey;

#[derive(Debug, Default)]
pub struct AlertThrottler {
    last_alert: Mutex<HashMap<ErrorKey, DateTime<Utc>>>,
}

impl AlertThrottler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the key never alerted or its last alert is older than
    /// `cooldown`.
    pub fn should_alert(&self, error_type: &str, platform: &str, cooldown: Duration) -> bool {
        self.should_alert_at(error_type, platform, cooldown, Utc::now())
    }

    pub fn should_alert_at(
        &self,
        error_type: &str,
        platform: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let key = ErrorKey::new(error_type, platform);
        match self.last_alert.lock().get(&key) {
            None => true,
            Some(last) => now > *last + cooldown,
        }
    }

    pub fn record_alert(&self, error_type: &str, platform: &str) {
        self.record_alert_at(error_type, platform, Utc::now());
    }

    pub fn record_alert_at(&self, error_type: &str, platform: &str, now: DateTime<Utc>) {
        let key = ErrorKey::new(error_type, platform);
        self.last_alert.lock().insert(key, now);
    }

    /// Drop entries whose last alert is older than `max_age`. Returns the
    /// number evicted.
    pub fn sweep(&self, max_age: Duration) -> usize {
        self.sweep_at(max_age, Utc::now())
    }

    pub fn sweep_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let mut map = self.last_alert.lock();
        let before = map.len();
        map.retain(|_, last| now - *last <= max_age);
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(evicted, remaining = map.len(), "throttle entries swept");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.last_alert.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
