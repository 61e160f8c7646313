//! Alert outbox.
//!
//! Alerts are written here as soon as the engine raises them. Delivery is
//! someone else's job: a notifier reads `pending`, sends, then calls
//! `mark_dispatched`. Rows are kept after dispatch for auditing.

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::detect::alert::AnomalyAlert;
use crate::storage::{to_ms, StoreResult};

/// Queue an alert.
pub fn enqueue(conn: &Connection, alert: &AnomalyAlert) -> StoreResult<()> {
    let payload = serde_json::to_string(alert)?;
    conn.execute(
        "INSERT INTO alert_outbox (id, error_type, platform, payload_json, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            alert.id.to_string(),
            alert.error_type,
            alert.platform,
            payload,
            to_ms(alert.raised_at)
        ],
    )?;
    Ok(())
}

/// Oldest undispatched alerts first.
pub fn pending(conn: &Connection, limit: usize) -> StoreResult<Vec<AnomalyAlert>> {
    let mut stmt = conn.prepare(
        "SELECT id, payload_json FROM alert_outbox
         WHERE dispatched = 0 ORDER BY created_at_ms, id LIMIT ?1",
    )?;

    let rows: Vec<(String, String)> = stmt
        .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    let mut alerts = Vec::with_capacity(rows.len());
    for (id, json) in rows {
        match serde_json::from_str::<AnomalyAlert>(&json) {
            Ok(alert) => alerts.push(alert),
            // Leave it in place; a bad row must not block the rest of the queue.
            Err(e) => tracing::error!(%id, error = %e, "unreadable outbox entry"),
        }
    }
    Ok(alerts)
}

/// Mark alerts as delivered. Returns how many rows changed.
pub fn mark_dispatched(conn: &mut Connection, ids: &[Uuid]) -> StoreResult<usize> {
    let tx = conn.transaction()?;
    let mut changed = 0;
    {
        let mut stmt = tx.prepare("UPDATE alert_outbox SET dispatched = 1 WHERE id = ?1 AND dispatched = 0")?;
        for id in ids {
            changed += stmt.execute(params![id.to_string()])?;
        }
    }
    tx.commit()?;
    tracing::debug!(changed, "outbox entries dispatched");
    Ok(changed)
}
