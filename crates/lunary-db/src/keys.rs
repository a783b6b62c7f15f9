//! Project API key lookup.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::DbError;

/// Kind of project API key.
///
/// Public keys may only ingest events; private keys may also read data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Public,
    Private,
}

impl KeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::Public => "public",
            KeyKind::Private => "private",
        }
    }
}

impl FromSql for KeyKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "public" => Ok(KeyKind::Public),
            "private" => Ok(KeyKind::Private),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A resolved API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub project_id: String,
    pub org_id: i64,
    pub kind: KeyKind,
}

/// Looks up an API key, returning `None` if it does not exist.
pub fn find_api_key(conn: &Connection, api_key: &str) -> Result<Option<ApiKeyRecord>, DbError> {
    let record = conn
        .query_row(
            "SELECT k.project_id, p.org_id, k.kind
             FROM api_key k
             JOIN project p ON p.id = k.project_id
             WHERE k.api_key = ?1",
            [api_key],
            |row| {
                Ok(ApiKeyRecord {
                    project_id: row.get(0)?,
                    org_id: row.get(1)?,
                    kind: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;

    #[test]
    fn finds_known_keys_and_ignores_unknown() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");
        conn.execute_batch(
            "INSERT INTO org (id, name) VALUES (7, 'Acme');
             INSERT INTO project (id, org_id, name) VALUES ('p1', 7, 'Chatbot');
             INSERT INTO api_key (project_id, api_key, kind) VALUES ('p1', 'pk-public', 'public');
             INSERT INTO api_key (project_id, api_key, kind) VALUES ('p1', 'sk-private', 'private');",
        )
        .expect("seed keys");

        let public = find_api_key(&conn, "pk-public")
            .expect("query should succeed")
            .expect("key should exist");
        assert_eq!(
            public,
            ApiKeyRecord {
                project_id: "p1".to_string(),
                org_id: 7,
                kind: KeyKind::Public,
            }
        );

        let private = find_api_key(&conn, "sk-private")
            .expect("query should succeed")
            .expect("key should exist");
        assert_eq!(private.kind, KeyKind::Private);

        assert!(find_api_key(&conn, "nope").expect("query").is_none());
    }
}
