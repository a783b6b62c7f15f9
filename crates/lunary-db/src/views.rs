//! Materialized-view refresh.
//!
//! Each view is a summary table whose full contents are replaced by the
//! result of its `SELECT`. A refresh runs in a single transaction, so readers
//! never observe a half-rebuilt table.

use rusqlite::Connection;

use crate::DbError;

/// A summary table and the query that rebuilds it.
#[derive(Debug, Clone, Copy)]
pub struct MaterializedView {
    /// Table name.
    pub name: &'static str,
    /// Query whose rows replace the table contents, in column order.
    pub select: &'static str,
}

/// All materialized views, refreshed in this order.
pub const MATERIALIZED_VIEWS: &[MaterializedView] = &[
    MaterializedView {
        name: "daily_usage_mv",
        select: "SELECT project_id,
                        date(created_at),
                        type,
                        COUNT(*),
                        SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END),
                        SUM(prompt_tokens),
                        SUM(completion_tokens),
                        SUM(cost)
                 FROM run
                 GROUP BY project_id, date(created_at), type",
    },
    MaterializedView {
        name: "model_usage_mv",
        select: "SELECT project_id,
                        name,
                        COUNT(*),
                        SUM(prompt_tokens),
                        SUM(completion_tokens),
                        SUM(cost)
                 FROM run
                 WHERE type = 'llm' AND name IS NOT NULL
                 GROUP BY project_id, name",
    },
];

/// Outcome of refreshing one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRefresh {
    /// View (table) name.
    pub name: &'static str,
    /// Rows in the view after the refresh.
    pub rows: usize,
}

/// Rebuilds every view in [`MATERIALIZED_VIEWS`].
///
/// Views are refreshed independently; the first failure aborts the remaining
/// refreshes and is returned, leaving already refreshed views committed.
pub fn refresh_materialized_views(conn: &Connection) -> Result<Vec<ViewRefresh>, DbError> {
    MATERIALIZED_VIEWS
        .iter()
        .map(|view| refresh_view(conn, view))
        .collect()
}

fn refresh_view(conn: &Connection, view: &MaterializedView) -> Result<ViewRefresh, DbError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(&format!("DELETE FROM {}", view.name), [])?;
    let rows = tx.execute(&format!("INSERT INTO {} {}", view.name, view.select), [])?;
    tx.execute(
        "INSERT INTO _materialized_views (name, row_count, refreshed_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET
            row_count = excluded.row_count,
            refreshed_at = excluded.refreshed_at",
        rusqlite::params![view.name, rows as i64],
    )?;
    tx.commit()?;

    tracing::debug!(view = view.name, rows, "refreshed materialized view");
    Ok(ViewRefresh {
        name: view.name,
        rows,
    })
}
