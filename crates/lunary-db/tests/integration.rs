use lunary_db::{
    find_api_key, insert_runs, refresh_materialized_views, run_migrations, Database, DbError,
    DbRuntimeSettings, DrainOutcome, KeyKind, NewRun,
};
use std::time::Duration;

fn file_database() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("lunary.db");
    let db = Database::open(
        path.to_str().expect("utf-8 temp path"),
        DbRuntimeSettings::default(),
    );
    (dir, db)
}

#[test]
fn migrations_are_visible_to_every_pooled_connection() {
    let (_dir, db) = file_database();
    db.check_connection().expect("file database should be reachable");
    {
        let conn = db.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
        conn.execute_batch(
            "INSERT INTO org (id, name) VALUES (1, 'Acme');
             INSERT INTO project (id, org_id, name) VALUES ('p1', 1, 'Chatbot');
             INSERT INTO api_key (project_id, api_key, kind) VALUES ('p1', 'pk', 'public');",
        )
        .expect("failed to seed");
    }

    let first = db.get().expect("first connection");
    let second = db.get().expect("second connection");
    let record = find_api_key(&second, "pk")
        .expect("lookup should succeed")
        .expect("key should be visible from another connection");
    assert_eq!(record.kind, KeyKind::Public);
    drop(first);
}

#[test]
fn ingest_then_refresh_then_close() {
    let (_dir, db) = file_database();
    {
        let conn = db.get().expect("connection");
        run_migrations(&conn).expect("migrations");
        conn.execute_batch(
            "INSERT INTO org (id, name) VALUES (1, 'Acme');
             INSERT INTO project (id, org_id, name) VALUES ('p1', 1, 'Chatbot');",
        )
        .expect("seed");

        let run = NewRun {
            id: "r1".to_string(),
            run_type: "llm".to_string(),
            name: Some("gpt-4o".to_string()),
            status: Some("success".to_string()),
            prompt_tokens: Some(5),
            completion_tokens: Some(7),
            cost: Some(0.01),
            created_at: None,
            ended_at: None,
        };
        insert_runs(&conn, "p1", &[run]).expect("insert");
        let refreshed = refresh_materialized_views(&conn).expect("refresh");
        assert!(refreshed.iter().all(|view| view.rows == 1));
    }

    assert_eq!(db.close(Duration::from_secs(5)), DrainOutcome::Drained);
    assert!(matches!(db.get(), Err(DbError::Closed)));
}
