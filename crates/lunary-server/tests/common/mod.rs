#![allow(dead_code)]

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use lunary_db::{run_migrations, Database, DbRuntimeSettings};
use lunary_observe::{ErrorEvent, ErrorReporter};
use lunary_server::{
    config::{Config, Environment},
    AppState,
};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

pub const PUBLIC_KEY: &str = "pk-acme";
pub const PRIVATE_KEY: &str = "sk-acme";
pub const CAPPED_KEY: &str = "pk-capped";

/// Keeps every reported event for assertions.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ErrorEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ErrorEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, event: ErrorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// In-memory log sink for asserting on access-log output.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Installs an INFO-level subscriber for the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct TestDb {
    _dir: tempfile::TempDir,
    pub path: String,
    pub db: Database,
}

/// File-backed database with two orgs: `Acme` (project `p1`, public and
/// private keys) and `Capped` (project `p2`, over its daily limit).
pub fn seeded_db() -> TestDb {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir
        .path()
        .join("lunary.db")
        .to_str()
        .expect("utf-8 temp path")
        .to_string();
    let db = Database::open(&path, DbRuntimeSettings::default());
    {
        let conn = db.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
        conn.execute_batch(&format!(
            "INSERT INTO org (id, name, daily_event_limit) VALUES (1, 'Acme', 1000);
             INSERT INTO org (id, name, daily_event_count, daily_event_limit, limited)
                 VALUES (2, 'Capped', 50, 10, 1);
             INSERT INTO project (id, org_id, name) VALUES ('p1', 1, 'Chatbot');
             INSERT INTO project (id, org_id, name) VALUES ('p2', 2, 'Side project');
             INSERT INTO api_key (project_id, api_key, kind) VALUES ('p1', '{PUBLIC_KEY}', 'public');
             INSERT INTO api_key (project_id, api_key, kind) VALUES ('p1', '{PRIVATE_KEY}', 'private');
             INSERT INTO api_key (project_id, api_key, kind) VALUES ('p2', '{CAPPED_KEY}', 'public');"
        ))
        .expect("failed to seed database");
    }
    TestDb {
        _dir: dir,
        path,
        db,
    }
}

/// Config for a loopback server on an ephemeral port.
pub fn test_config(db_path: &str) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".parse().unwrap();
    config.server.port = 0;
    config.database.path = db_path.to_string();
    config.database.connect_timeout_ms = 500;
    config.deployment.environment = Environment::Test;
    config
}

pub fn app_state(db: &Database, config: Config, reporter: Arc<RecordingReporter>) -> AppState {
    AppState::new(Arc::new(config), db.clone(), reporter)
}

pub fn json_request(
    method: &str,
    uri: &str,
    key: Option<&str>,
    body: &serde_json::Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get_request(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::empty()).unwrap()
}

/// Sends a request and decodes the JSON body (`Null` when not JSON).
pub async fn send(
    app: &Router,
    request: Request<Body>,
) -> (StatusCode, HeaderMap, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, headers, json)
}

pub fn count_rows(db: &Database, table: &str) -> i64 {
    db.get()
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}
