//! Organization usage accounting and usage analytics.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::DbError;

/// One row of the `daily_usage_mv` summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub day: String,
    pub run_type: String,
    pub runs: i64,
    pub errors: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
}

/// Returns whether the org owning `project_id` is over its daily quota.
///
/// Unknown projects are reported as not limited.
pub fn org_is_limited(conn: &Connection, project_id: &str) -> Result<bool, DbError> {
    let limited = conn
        .query_row(
            "SELECT o.limited FROM org o JOIN project p ON p.org_id = o.id WHERE p.id = ?1",
            [project_id],
            |row| row.get::<_, bool>(0),
        )
        .optional()?;
    Ok(limited.unwrap_or(false))
}

/// Starts a new usage day: zeroes every org's event count and lifts limits.
///
/// Returns the number of orgs changed.
pub fn reset_daily_event_counts(conn: &Connection) -> Result<usize, DbError> {
    let changed = conn.execute(
        "UPDATE org SET daily_event_count = 0, limited = 0
         WHERE daily_event_count != 0 OR limited != 0",
        [],
    )?;
    Ok(changed)
}

/// Marks orgs at or above their daily event limit as limited, and clears the
/// flag on orgs back under it. Orgs without a limit are never limited.
///
/// Returns the number of orgs whose flag changed.
pub fn update_limited_orgs(conn: &Connection) -> Result<usize, DbError> {
    let changed = conn.execute(
        "UPDATE org SET limited = (
            daily_event_limit IS NOT NULL AND daily_event_count >= daily_event_limit
         )
         WHERE limited != (
            daily_event_limit IS NOT NULL AND daily_event_count >= daily_event_limit
         )",
        [],
    )?;
    Ok(changed)
}

/// Reads the materialized daily usage of a project, most recent day first.
pub fn daily_usage(
    conn: &Connection,
    project_id: &str,
    limit_days: u32,
) -> Result<Vec<DailyUsage>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT day, run_type, runs, errors, prompt_tokens, completion_tokens, cost
         FROM daily_usage_mv
         WHERE project_id = ?1
           AND day IN (
               SELECT DISTINCT day FROM daily_usage_mv
               WHERE project_id = ?1
               ORDER BY day DESC
               LIMIT ?2
           )
         ORDER BY day DESC, run_type",
    )?;
    let rows = stmt
        .query_map(params![project_id, limit_days], |row| {
            Ok(DailyUsage {
                day: row.get(0)?,
                run_type: row.get(1)?,
                runs: row.get(2)?,
                errors: row.get(3)?,
                prompt_tokens: row.get(4)?,
                completion_tokens: row.get(5)?,
                cost: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");
        conn.execute_batch(
            "INSERT INTO org (id, name, daily_event_count, daily_event_limit) VALUES
                (1, 'Over', 1500, 1000),
                (2, 'Under', 10, 1000),
                (3, 'Unlimited', 99999, NULL);
             INSERT INTO project (id, org_id, name) VALUES
                ('p1', 1, 'A'), ('p2', 2, 'B'), ('p3', 3, 'C');",
        )
        .expect("seed orgs");
        conn
    }

    #[test]
    fn update_limited_orgs_flags_only_orgs_over_limit() {
        let conn = seeded();
        assert_eq!(update_limited_orgs(&conn).expect("update"), 1);
        assert!(org_is_limited(&conn, "p1").expect("p1"));
        assert!(!org_is_limited(&conn, "p2").expect("p2"));
        assert!(!org_is_limited(&conn, "p3").expect("p3"));

        // Second pass changes nothing.
        assert_eq!(update_limited_orgs(&conn).expect("update again"), 0);
    }

    #[test]
    fn reset_clears_counts_and_limits() {
        let conn = seeded();
        update_limited_orgs(&conn).expect("update");

        assert_eq!(reset_daily_event_counts(&conn).expect("reset"), 3);
        assert!(!org_is_limited(&conn, "p1").expect("p1"));

        let total: i64 = conn
            .query_row("SELECT SUM(daily_event_count) FROM org", [], |row| row.get(0))
            .expect("sum");
        assert_eq!(total, 0);
    }

    #[test]
    fn unknown_project_is_not_limited() {
        let conn = seeded();
        assert!(!org_is_limited(&conn, "missing").expect("query"));
    }

    #[test]
    fn daily_usage_reads_most_recent_days() {
        let conn = seeded();
        conn.execute_batch(
            "INSERT INTO daily_usage_mv VALUES
                ('p1', '2026-10-01', 'llm', 2, 0, 10, 10, 0.1),
                ('p1', '2026-10-02', 'llm', 3, 1, 20, 20, 0.2),
                ('p1', '2026-10-02', 'chain', 1, 0, 0, 0, 0.0),
                ('p2', '2026-10-02', 'llm', 9, 0, 0, 0, 0.0);",
        )
        .expect("seed usage");

        let usage = daily_usage(&conn, "p1", 1).expect("usage");
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|u| u.day == "2026-10-02"));
        assert_eq!(usage[0].run_type, "chain");

        let all = daily_usage(&conn, "p1", 30).expect("usage");
        assert_eq!(all.len(), 3);
    }
}
