//! Run ingestion and project listing.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::DbError;

/// A run event as submitted by an SDK.
///
/// Later events for the same `id` (for example an `end` event carrying token
/// counts) update the stored run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    #[serde(alias = "runId")]
    pub id: String,
    #[serde(rename = "type")]
    pub run_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub prompt_tokens: Option<i64>,
    #[serde(default)]
    pub completion_tokens: Option<i64>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
}

/// A project belonging to an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

/// Upserts `runs` into `project_id` and charges them to the owning org's
/// daily event count, all in one transaction.
///
/// Returns the number of events stored. A run id already owned by another
/// project is skipped and neither counted nor charged.
pub fn insert_runs(
    conn: &Connection,
    project_id: &str,
    runs: &[NewRun],
) -> Result<usize, DbError> {
    let tx = conn.unchecked_transaction()?;
    let mut stored = 0;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO run (id, project_id, type, name, status, prompt_tokens,
                              completion_tokens, cost, created_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, COALESCE(?5, 'started'), COALESCE(?6, 0),
                     COALESCE(?7, 0), COALESCE(?8, 0), COALESCE(?9, datetime('now')), ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(excluded.name, run.name),
                status = COALESCE(?5, run.status),
                prompt_tokens = COALESCE(?6, run.prompt_tokens),
                completion_tokens = COALESCE(?7, run.completion_tokens),
                cost = COALESCE(?8, run.cost),
                ended_at = COALESCE(excluded.ended_at, run.ended_at)
             WHERE run.project_id = excluded.project_id",
        )?;
        for run in runs {
            stored += stmt.execute(params![
                run.id,
                project_id,
                run.run_type,
                run.name,
                run.status,
                run.prompt_tokens,
                run.completion_tokens,
                run.cost,
                run.created_at,
                run.ended_at,
            ])?;
        }
    }
    tx.execute(
        "UPDATE org SET daily_event_count = daily_event_count + ?1
         WHERE id = (SELECT org_id FROM project WHERE id = ?2)",
        params![stored as i64, project_id],
    )?;
    tx.commit()?;
    Ok(stored)
}

/// Lists the projects of an organization, oldest first.
pub fn list_projects(conn: &Connection, org_id: i64) -> Result<Vec<Project>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, created_at FROM project WHERE org_id = ?1 ORDER BY created_at, id",
    )?;
    let projects = stmt
        .query_map([org_id], |row| {
            Ok(Project {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(projects)
}
