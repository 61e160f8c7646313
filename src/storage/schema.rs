//! Database schema and migrations.
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch so that
//! bucketing can be done with integer division inside SQLite.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS error_identities (
            id INTEGER PRIMARY KEY,
            fingerprint TEXT NOT NULL UNIQUE,
            error_type TEXT NOT NULL,
            platform TEXT NOT NULL,
            normalized_message TEXT NOT NULL,
            backtrace_signature TEXT,
            occurrence_count INTEGER NOT NULL DEFAULT 0,
            first_seen_ms INTEGER NOT NULL,
            last_seen_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS occurrences (
            id INTEGER PRIMARY KEY,
            identity_id INTEGER NOT NULL,
            error_type TEXT NOT NULL,
            platform TEXT NOT NULL,
            message TEXT NOT NULL,
            backtrace_json TEXT NOT NULL,
            occurred_at_ms INTEGER NOT NULL,
            FOREIGN KEY (identity_id) REFERENCES error_identities(id)
        );

        CREATE TABLE IF NOT EXISTS baselines (
            id INTEGER PRIMARY KEY,
            error_type TEXT NOT NULL,
            platform TEXT NOT NULL,
            granularity TEXT NOT NULL,
            period_start_ms INTEGER NOT NULL,
            period_end_ms INTEGER NOT NULL,
            mean REAL NOT NULL,
            std_dev REAL NOT NULL,
            p95 REAL NOT NULL,
            p99 REAL NOT NULL,
            sample_size INTEGER NOT NULL,
            UNIQUE (error_type, platform, granularity),
            CHECK (period_end_ms > period_start_ms),
            CHECK (std_dev >= 0)
        );

        CREATE TABLE IF NOT EXISTS cascade_patterns (
            id INTEGER PRIMARY KEY,
            parent_identity_id INTEGER NOT NULL,
            child_identity_id INTEGER NOT NULL,
            frequency INTEGER NOT NULL,
            avg_delay_seconds REAL NOT NULL,
            cascade_probability REAL,
            last_detected_at_ms INTEGER NOT NULL,
            UNIQUE (parent_identity_id, child_identity_id),
            CHECK (parent_identity_id <> child_identity_id),
            CHECK (frequency >= 1)
        );

        CREATE TABLE IF NOT EXISTS alert_outbox (
            id TEXT PRIMARY KEY,
            error_type TEXT NOT NULL,
            platform TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            dispatched INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_occurrences_time ON occurrences(occurred_at_ms);
        CREATE INDEX IF NOT EXISTS idx_occurrences_key_time
            ON occurrences(error_type, platform, occurred_at_ms);
        CREATE INDEX IF NOT EXISTS idx_occurrences_identity_time
            ON occurrences(identity_id, occurred_at_ms);
        CREATE INDEX IF NOT EXISTS idx_identities_signature ON error_identities(backtrace_signature);
        CREATE INDEX IF NOT EXISTS idx_identities_type ON error_identities(error_type, platform);
        CREATE INDEX IF NOT EXISTS idx_outbox_pending ON alert_outbox(dispatched, created_at_ms);",
    )?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}
