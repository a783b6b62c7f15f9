//! Inbound webhook event log.

use rusqlite::{params, Connection};

use crate::DbError;

/// Records a webhook delivery.
///
/// Providers retry deliveries, so the `(provider, event_id)` pair is unique:
/// returns `false` when the event was already recorded.
pub fn record_webhook_event(
    conn: &Connection,
    provider: &str,
    event_id: &str,
    event_type: &str,
    payload: &str,
) -> Result<bool, DbError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO webhook_event (provider, event_id, event_type, payload)
         VALUES (?1, ?2, ?3, ?4)",
        params![provider, event_id, event_type, payload],
    )?;
    Ok(inserted == 1)
}

/// Deletes webhook events received more than `older_than_days` days ago.
pub fn prune_webhook_events(conn: &Connection, older_than_days: u32) -> Result<usize, DbError> {
    let deleted = conn.execute(
        "DELETE FROM webhook_event WHERE received_at < datetime('now', ?1)",
        [format!("-{older_than_days} days")],
    )?;
    Ok(deleted)
}
