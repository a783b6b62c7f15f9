//! Schema migrations, embedded at compile time and recorded by name in
//! `_lunary_migrations`.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

/// A single embedded migration.
#[derive(Clone, Copy)]
struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Schema migrations, applied in order.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_core",
        sql: include_str!("migrations/001_core.sql"),
    },
    Migration {
        name: "002_materialized_views",
        sql: include_str!("migrations/002_materialized_views.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("could not create the migration ledger: {0}")]
    Ledger(rusqlite::Error),

    #[error("could not read applied migrations: {0}")]
    StateQuery(rusqlite::Error),

    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: &'static str,
        source: rusqlite::Error,
    },
}

/// Brings the schema up to date.
///
/// Returns the names of the migrations applied by this call, in order; an
/// up-to-date database yields an empty list.
pub fn run_migrations(conn: &Connection) -> Result<Vec<&'static str>, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn applied_names(conn: &Connection) -> Result<HashSet<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT name FROM _lunary_migrations")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(names)
}

fn apply(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<Vec<&'static str>, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _lunary_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(MigrationError::Ledger)?;

    let done = applied_names(conn).map_err(MigrationError::StateQuery)?;
    let mut applied = Vec::new();

    for migration in migrations.iter().filter(|m| !done.contains(m.name)) {
        let name = migration.name;
        let failed = |source| MigrationError::ExecutionFailed { name, source };

        // Schema changes and the ledger row commit together.
        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute("INSERT INTO _lunary_migrations (name) VALUES (?1)", [name])
            .map_err(failed)?;
        tx.commit().map_err(failed)?;

        tracing::debug!(migration = name, "applied migration");
        applied.push(name);
    }

    Ok(applied)
}
