//! Batch execution helpers shared by the periodic analytics jobs.

use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Set of keys currently being processed.
///
/// Incremental updates (running means, counters) are read-modify-write, so
/// two jobs must never work on the same key at once. Distinct keys are
/// independent.
#[derive(Debug)]
pub struct InFlight<K> {
    active: Mutex<HashSet<K>>,
}

impl<K: Eq + Hash + Clone> Default for InFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Claim `key`, or `None` if another job already holds it. The claim is
    /// released when the guard is dropped.
    pub fn try_acquire(&self, key: K) -> Option<InFlightGuard<'_, K>> {
        let mut active = self.active.lock();
        if !active.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard { owner: self, key })
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.active.lock().contains(key)
    }
}

/// Releases its key on drop.
pub struct InFlightGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a InFlight<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for InFlightGuard<'_, K> {
    fn drop(&mut self) {
        self.owner.active.lock().remove(&self.key);
    }
}

/// Outcome counts of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Keys skipped because another job held them.
    pub skipped: usize,
}

/// Run `job` for every key, one at a time, under the in-flight guard.
///
/// Errors are logged and counted per key and never stop the batch. Returns
/// the report and the successful outputs in key order.
pub fn run_keyed<K, T, E, F>(
    name: &str,
    inflight: &InFlight<K>,
    keys: impl IntoIterator<Item = K>,
    mut job: F,
) -> (BatchReport, Vec<T>)
where
    K: Eq + Hash + Clone + Display,
    E: Display,
    F: FnMut(&K) -> Result<T, E>,
{
    let mut report = BatchReport::default();
    let mut outputs = Vec::new();

    for key in keys {
        let Some(_guard) = inflight.try_acquire(key.clone()) else {
            warn!(job = name, %key, "key already in flight, skipping");
            report.skipped += 1;
            continue;
        };
        match job(&key) {
            Ok(out) => {
                report.succeeded += 1;
                outputs.push(out);
            }
            Err(e) => {
                warn!(job = name, %key, error = %e, "key failed, continuing with batch");
                report.failed += 1;
            }
        }
    }

    info!(
        job = name,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "batch finished"
    );
    (report, outputs)
}
