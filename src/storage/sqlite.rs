//! SQLite implementation of the repository traits.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::analysis::baseline::{Baseline, BaselineSet, Granularity};
use crate::analysis::cascade::CascadePattern;
use crate::analysis::stats::BaselineStats;
use crate::fingerprint::{self, FrameFilter};
use crate::occurrence::{ErrorIdentity, ErrorKey, IdentityId, NewOccurrence, Occurrence};
use crate::storage::{
    from_ms, to_ms, BaselineRepository, CascadeRepository, IdentityBucketCount, KeyCount,
    OccurrenceRepository, Pool, StoreError, StoreResult,
};

const HOUR_MS: i64 = 3_600_000;

const OCCURRENCE_COLUMNS: &str =
    "identity_id, error_type, platform, message, backtrace_json, occurred_at_ms";

type OccurrenceRow = (i64, String, String, String, String, i64);

fn read_occurrence(row: &Row<'_>) -> rusqlite::Result<OccurrenceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_occurrence(row: OccurrenceRow) -> StoreResult<Occurrence> {
    let (identity_id, error_type, platform, message, backtrace_json, at_ms) = row;
    Ok(Occurrence {
        error_type,
        platform,
        message,
        backtrace: serde_json::from_str(&backtrace_json)?,
        occurred_at: from_ms(at_ms)?,
        error_identity_id: IdentityId(identity_id),
    })
}

fn count(n: i64) -> u64 {
    n.max(0) as u64
}

/// Leading namespace of an error type name (`ActiveRecord` for
/// `ActiveRecord::RecordNotFound`, `java` for `java.io.IOException`).
fn type_prefix(error_type: &str) -> &str {
    error_type
        .split(|c| c == ':' || c == '.')
        .next()
        .unwrap_or(error_type)
}

/// Repository backed by the connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
    frames: FrameFilter,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            frames: FrameFilter::default(),
        }
    }

    /// Use `frames` to pick the frames that make up backtrace signatures.
    pub fn with_frame_filter(mut self, frames: FrameFilter) -> Self {
        self.frames = frames;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Assign a raw occurrence to its identity and store it.
    ///
    /// The identity is created on first sight; its counters and first/last
    /// seen times are updated in the same transaction as the insert.
    pub fn record_occurrence(&self, new: &NewOccurrence) -> StoreResult<Occurrence> {
        let key = ErrorKey::new(&new.error_type, &new.platform);
        let message = new.message.clone().unwrap_or_default();
        let backtrace = new.backtrace.clone().unwrap_or_default();

        let normalized = fingerprint::normalize(&message);
        let signature = self.frames.signature(&backtrace);
        let fp = fingerprint::fingerprint(&key, &normalized, signature.as_deref());
        let at_ms = to_ms(new.occurred_at);

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO error_identities
                (fingerprint, error_type, platform, normalized_message, backtrace_signature,
                 occurrence_count, first_seen_ms, last_seen_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(fingerprint) DO UPDATE SET
                occurrence_count = occurrence_count + 1,
                first_seen_ms = MIN(first_seen_ms, excluded.first_seen_ms),
                last_seen_ms = MAX(last_seen_ms, excluded.last_seen_ms)",
            params![fp, key.error_type, key.platform, normalized, signature, at_ms],
        )?;
        let identity_id: i64 = tx.query_row(
            "SELECT id FROM error_identities WHERE fingerprint = ?1",
            params![fp],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO occurrences
                (identity_id, error_type, platform, message, backtrace_json, occurred_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity_id,
                key.error_type,
                key.platform,
                message,
                serde_json::to_string(&backtrace)?,
                at_ms
            ],
        )?;
        tx.commit()?;

        debug!(identity = identity_id, key = %key, "occurrence recorded");
        Ok(Occurrence {
            error_type: key.error_type,
            platform: key.platform,
            message,
            backtrace,
            occurred_at: new.occurred_at,
            error_identity_id: IdentityId(identity_id),
        })
    }

    pub fn identity(&self, id: IdentityId) -> StoreResult<Option<ErrorIdentity>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT error_type, platform, normalized_message, backtrace_signature,
                        occurrence_count, first_seen_ms, last_seen_ms
                 FROM error_identities WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(error_type, platform, normalized_message, signature, n, first, last)| -> StoreResult<ErrorIdentity> {
                Ok(ErrorIdentity {
                    id,
                    error_type,
                    platform,
                    normalized_message,
                    backtrace_signature: signature,
                    occurrence_count: count(n),
                    first_seen: from_ms(first)?,
                    last_seen: from_ms(last)?,
                })
            },
        )
        .transpose()
    }

    fn identity_ids(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<IdentityId>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get::<_, i64>(0))?
            .map(|r| r.map(IdentityId))
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }
}

impl OccurrenceRepository for SqliteStore {
    fn fetch_occurrence_counts(
        &self,
        key: &ErrorKey,
        granularity: Granularity,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<u64>> {
        let conn = self.pool.get()?;
        let first_seen: Option<i64> = conn.query_row(
            "SELECT MIN(first_seen_ms) FROM error_identities
             WHERE error_type = ?1 AND platform = ?2",
            params![key.error_type, key.platform],
            |row| row.get(0),
        )?;
        let Some(first_seen) = first_seen else {
            return Ok(Vec::new());
        };

        let offset = granularity.bucket_offset_ms();
        let size = granularity.bucket_ms();
        let bucket = |ms: i64| (ms + offset).div_euclid(size);
        let first = bucket(to_ms(since).max(first_seen));
        let end = bucket(to_ms(until));
        if end <= first {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT (occurred_at_ms + ?3) / ?4 AS bucket, COUNT(*)
             FROM occurrences
             WHERE error_type = ?1 AND platform = ?2
               AND occurred_at_ms >= ?5 AND occurred_at_ms < ?6
             GROUP BY bucket",
        )?;
        let rows: Vec<(i64, i64)> = stmt
            .query_map(
                params![
                    key.error_type,
                    key.platform,
                    offset,
                    size,
                    first * size - offset,
                    end * size - offset
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<_, _>>()?;

        let mut counts = vec![0u64; (end - first) as usize];
        for (b, n) in rows {
            if let Some(slot) = usize::try_from(b - first).ok().and_then(|i| counts.get_mut(i)) {
                *slot = count(n);
            }
        }
        Ok(counts)
    }

    fn fetch_occurrences_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Occurrence>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrences
             WHERE occurred_at_ms >= ?1 AND occurred_at_ms < ?2
             ORDER BY occurred_at_ms, id"
        ))?;
        let rows: Vec<OccurrenceRow> = stmt
            .query_map(params![to_ms(start), to_ms(end)], read_occurrence)?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(into_occurrence).collect()
    }

    fn parent_occurrence_count(&self, identity: IdentityId) -> StoreResult<u64> {
        let conn = self.pool.get()?;
        let n: Option<i64> = conn
            .query_row(
                "SELECT occurrence_count FROM error_identities WHERE id = ?1",
                params![identity.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(n.map(count).unwrap_or(0))
    }

    fn error_keys(&self) -> StoreResult<Vec<ErrorKey>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT error_type, platform FROM error_identities
             ORDER BY error_type, platform",
        )?;
        let keys = stmt
            .query_map([], |row| {
                Ok(ErrorKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<_, _>>()?;
        Ok(keys)
    }

    fn recent_key_counts(&self, since: DateTime<Utc>) -> StoreResult<Vec<KeyCount>> {
        let conn = self.pool.get()?;
        // With MAX(), SQLite takes the bare identity_id from the newest row.
        let mut stmt = conn.prepare(
            "SELECT error_type, platform, COUNT(*), identity_id, MAX(occurred_at_ms)
             FROM occurrences
             WHERE occurred_at_ms >= ?1
             GROUP BY error_type, platform
             ORDER BY error_type, platform",
        )?;
        let counts = stmt
            .query_map(params![to_ms(since)], |row| {
                Ok(KeyCount {
                    key: ErrorKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    count: count(row.get(2)?),
                    latest_identity: row.get::<_, Option<i64>>(3)?.map(IdentityId),
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(counts)
    }

    fn identity_timestamps(
        &self,
        identity: IdentityId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DateTime<Utc>>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT occurred_at_ms FROM occurrences
             WHERE identity_id = ?1 AND occurred_at_ms >= ?2
             ORDER BY occurred_at_ms",
        )?;
        let raw: Vec<i64> = stmt
            .query_map(params![identity.0, to_ms(since)], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(from_ms).collect()
    }

    fn hourly_identity_counts(&self, since: DateTime<Utc>) -> StoreResult<Vec<IdentityBucketCount>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT identity_id, occurred_at_ms / ?2 AS bucket, COUNT(*)
             FROM occurrences
             WHERE occurred_at_ms >= ?1
             GROUP BY identity_id, bucket",
        )?;
        let rows = stmt
            .query_map(params![to_ms(since), HOUR_MS], |row| {
                Ok(IdentityBucketCount {
                    identity_id: IdentityId(row.get(0)?),
                    bucket: row.get(1)?,
                    count: count(row.get(2)?),
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn similarity_candidates(&self, target: IdentityId, limit: usize) -> StoreResult<Vec<Occurrence>> {
        let Some(t) = self.identity(target)? else {
            return Ok(Vec::new());
        };
        let lim = limit as i64;

        let mut tiers: Vec<Vec<IdentityId>> = Vec::with_capacity(3);
        if let Some(signature) = &t.backtrace_signature {
            tiers.push(self.identity_ids(
                "SELECT id FROM error_identities
                 WHERE backtrace_signature = ?1 AND id <> ?2
                 ORDER BY last_seen_ms DESC LIMIT ?3",
                params![signature, target.0, lim],
            )?);
        }
        tiers.push(self.identity_ids(
            "SELECT id FROM error_identities
             WHERE error_type = ?1 AND id <> ?2
             ORDER BY last_seen_ms DESC LIMIT ?3",
            params![t.error_type, target.0, lim],
        )?);
        let prefix = type_prefix(&t.error_type);
        tiers.push(self.identity_ids(
            "SELECT id FROM error_identities
             WHERE platform = ?1 AND substr(error_type, 1, length(?2)) = ?2 AND id <> ?3
             ORDER BY last_seen_ms DESC LIMIT ?4",
            params![t.platform, prefix, target.0, lim],
        )?);

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in tiers.into_iter().flatten() {
            if out.len() >= limit {
                break;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(occ) = self.latest_occurrence(id)? {
                out.push(occ);
            }
        }
        Ok(out)
    }

    fn latest_occurrence(&self, identity: IdentityId) -> StoreResult<Option<Occurrence>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {OCCURRENCE_COLUMNS} FROM occurrences
                     WHERE identity_id = ?1
                     ORDER BY occurred_at_ms DESC, id DESC LIMIT 1"
                ),
                params![identity.0],
                read_occurrence,
            )
            .optional()?;
        row.map(into_occurrence).transpose()
    }
}

impl BaselineRepository for SqliteStore {
    fn upsert_baseline(&self, baseline: &Baseline) -> StoreResult<()> {
        let conn = self.pool.get()?;
        let s = &baseline.stats;
        conn.execute(
            "INSERT INTO baselines
                (error_type, platform, granularity, period_start_ms, period_end_ms,
                 mean, std_dev, p95, p99, sample_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(error_type, platform, granularity) DO UPDATE SET
                period_start_ms = excluded.period_start_ms,
                period_end_ms = excluded.period_end_ms,
                mean = excluded.mean,
                std_dev = excluded.std_dev,
                p95 = excluded.p95,
                p99 = excluded.p99,
                sample_size = excluded.sample_size",
            params![
                baseline.error_type,
                baseline.platform,
                baseline.granularity.as_str(),
                to_ms(baseline.period_start),
                to_ms(baseline.period_end),
                s.mean,
                s.std_dev,
                s.p95,
                s.p99,
                s.sample_size as i64
            ],
        )?;
        Ok(())
    }

    fn fetch_baselines(&self, key: &ErrorKey) -> StoreResult<BaselineSet> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT granularity, period_start_ms, period_end_ms, mean, std_dev, p95, p99, sample_size
             FROM baselines WHERE error_type = ?1 AND platform = ?2",
        )?;
        let rows: Vec<(String, i64, i64, f64, f64, f64, f64, i64)> = stmt
            .query_map(params![key.error_type, key.platform], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        let mut set = BaselineSet::default();
        for (granularity, start, end, mean, std_dev, p95, p99, n) in rows {
            let granularity: Granularity = granularity.parse().map_err(StoreError::Invalid)?;
            set.insert(Baseline {
                error_type: key.error_type.clone(),
                platform: key.platform.clone(),
                granularity,
                period_start: from_ms(start)?,
                period_end: from_ms(end)?,
                stats: BaselineStats {
                    mean,
                    std_dev,
                    p95,
                    p99,
                    sample_size: count(n),
                },
            });
        }
        Ok(set)
    }
}

type CascadeRow = (i64, i64, i64, f64, Option<f64>, i64);

fn read_cascade(row: &Row<'_>) -> rusqlite::Result<CascadeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_cascade(row: CascadeRow) -> StoreResult<CascadePattern> {
    let (parent, child, frequency, avg_delay_seconds, probability, at_ms) = row;
    Ok(CascadePattern {
        parent_identity_id: IdentityId(parent),
        child_identity_id: IdentityId(child),
        frequency: count(frequency),
        avg_delay_seconds,
        cascade_probability: probability,
        last_detected_at: from_ms(at_ms)?,
    })
}

const CASCADE_COLUMNS: &str = "parent_identity_id, child_identity_id, frequency, \
     avg_delay_seconds, cascade_probability, last_detected_at_ms";

impl CascadeRepository for SqliteStore {
    fn fetch_cascade_pattern(
        &self,
        parent: IdentityId,
        child: IdentityId,
    ) -> StoreResult<Option<CascadePattern>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CASCADE_COLUMNS} FROM cascade_patterns
                     WHERE parent_identity_id = ?1 AND child_identity_id = ?2"
                ),
                params![parent.0, child.0],
                read_cascade,
            )
            .optional()?;
        row.map(into_cascade).transpose()
    }

    fn upsert_cascade_pattern(&self, pattern: &CascadePattern) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO cascade_patterns
                (parent_identity_id, child_identity_id, frequency, avg_delay_seconds,
                 cascade_probability, last_detected_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(parent_identity_id, child_identity_id) DO UPDATE SET
                frequency = excluded.frequency,
                avg_delay_seconds = excluded.avg_delay_seconds,
                cascade_probability = excluded.cascade_probability,
                last_detected_at_ms = excluded.last_detected_at_ms",
            params![
                pattern.parent_identity_id.0,
                pattern.child_identity_id.0,
                pattern.frequency as i64,
                pattern.avg_delay_seconds,
                pattern.cascade_probability,
                to_ms(pattern.last_detected_at)
            ],
        )?;
        Ok(())
    }

    fn list_cascade_patterns(&self, limit: usize) -> StoreResult<Vec<CascadePattern>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CASCADE_COLUMNS} FROM cascade_patterns
             ORDER BY frequency DESC, parent_identity_id, child_identity_id
             LIMIT ?1"
        ))?;
        let rows: Vec<CascadeRow> = stmt
            .query_map(params![limit as i64], read_cascade)?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(into_cascade).collect()
    }
}
