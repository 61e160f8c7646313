//! SQLite storage layer -- schema, repositories, outbox.
//!
//! The analytics components only see the repository traits below; the
//! SQLite-backed [`SqliteStore`] is the reference implementation used by the
//! binary and the integration tests.

pub mod outbox;
pub mod schema;
mod sqlite;

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use thiserror::Error;

use crate::analysis::baseline::{Baseline, BaselineSet, Granularity};
use crate::analysis::cascade::CascadePattern;
use crate::occurrence::{ErrorKey, IdentityId, Occurrence};

pub use self::sqlite::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: impl AsRef<Path>) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Occurrence count of one (error_type, platform) key over a recent window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyCount {
    pub key: ErrorKey,
    pub count: u64,
    /// Identity of the most recent occurrence in the window.
    pub latest_identity: Option<IdentityId>,
}

/// Occurrences of one identity inside one hourly bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityBucketCount {
    pub identity_id: IdentityId,
    /// Hours since the Unix epoch.
    pub bucket: i64,
    pub count: u64,
}

/// Read access to occurrence history.
pub trait OccurrenceRepository {
    /// Per-bucket counts for `key`, one entry per bucket (empty buckets
    /// count 0), oldest first.
    ///
    /// The range starts at the bucket holding `since`, or the key's first
    /// sighting when that is later. It stops before the bucket holding
    /// `until`, which is still filling.
    fn fetch_occurrence_counts(
        &self,
        key: &ErrorKey,
        granularity: Granularity,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<u64>>;

    /// Every occurrence with `start <= occurred_at < end`, oldest first.
    fn fetch_occurrences_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Occurrence>>;

    /// Total number of occurrences ever recorded for an identity.
    fn parent_occurrence_count(&self, identity: IdentityId) -> StoreResult<u64>;

    /// Every (error_type, platform) pair with at least one occurrence.
    fn error_keys(&self) -> StoreResult<Vec<ErrorKey>>;

    /// Occurrence counts per key since `since`.
    fn recent_key_counts(&self, since: DateTime<Utc>) -> StoreResult<Vec<KeyCount>>;

    /// Occurrence times of one identity since `since`, oldest first.
    fn identity_timestamps(
        &self,
        identity: IdentityId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DateTime<Utc>>>;

    /// Hourly occurrence counts of every identity since `since`.
    fn hourly_identity_counts(&self, since: DateTime<Utc>)
        -> StoreResult<Vec<IdentityBucketCount>>;

    /// Latest occurrence of each identity worth comparing against `target`:
    /// same backtrace signature first, then same error type, then same
    /// platform with the same type-name prefix. The target is excluded.
    fn similarity_candidates(
        &self,
        target: IdentityId,
        limit: usize,
    ) -> StoreResult<Vec<Occurrence>>;

    fn latest_occurrence(&self, identity: IdentityId) -> StoreResult<Option<Occurrence>>;
}

/// Baseline persistence. One row per (error_type, platform, granularity).
pub trait BaselineRepository {
    /// Create or fully replace the baseline row for its key and granularity.
    fn upsert_baseline(&self, baseline: &Baseline) -> StoreResult<()>;

    fn fetch_baselines(&self, key: &ErrorKey) -> StoreResult<BaselineSet>;
}

/// Cascade pattern persistence. One row per (parent, child) pair.
pub trait CascadeRepository {
    fn fetch_cascade_pattern(
        &self,
        parent: IdentityId,
        child: IdentityId,
    ) -> StoreResult<Option<CascadePattern>>;

    fn upsert_cascade_pattern(&self, pattern: &CascadePattern) -> StoreResult<()>;

    /// Patterns ordered by descending frequency.
    fn list_cascade_patterns(&self, limit: usize) -> StoreResult<Vec<CascadePattern>>;
}

pub(crate) fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Invalid(format!("timestamp out of range: {ms}")))
}
