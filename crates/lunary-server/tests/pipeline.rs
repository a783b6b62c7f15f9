mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    routing::{get, post},
    Router,
};
use common::*;
use lunary_observe::ErrorKind;
use lunary_server::{app, errors::ApiError, with_pipeline};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

async fn exploding_handler() -> &'static str {
    panic!("handler exploded")
}

async fn failing_handler() -> Result<&'static str, ApiError> {
    Err(ApiError::InternalServerError("db exploded".to_string()))
}

#[tokio::test]
async fn panicking_handler_is_reported_and_answered() {
    let test_db = seeded_db();
    let reporter = Arc::new(RecordingReporter::default());
    let routes = Router::new()
        .route("/v1/boom", get(exploding_handler))
        .route("/v1/health", get(|| async { "ok" }));
    let app = with_pipeline(
        routes,
        app_state(&test_db.db, test_config(&test_db.path), reporter.clone()),
    );

    let (status, _, body) = send(&app, get_request("/v1/boom", Some(PRIVATE_KEY))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Internal Server Error");

    let events = reporter.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ErrorKind::Panic);
    assert_eq!(events[0].path, "/v1/boom");
    assert_eq!(events[0].status, 500);
    assert_eq!(events[0].message, "handler exploded");

    // The process keeps serving.
    let (status, _, _) = send(&app, get_request("/v1/health", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn panicking_request_still_appears_in_access_log() {
    let test_db = seeded_db();
    let logs = CapturedLogs::default();
    let _guard = logs.install();
    let routes = Router::new()
        .route("/v1/boom", get(exploding_handler))
        .route("/v1/ok", get(|| async { "ok" }));
    let app = with_pipeline(
        routes,
        app_state(
            &test_db.db,
            test_config(&test_db.path),
            Arc::new(RecordingReporter::default()),
        ),
    );

    let (status, _, _) = send(&app, get_request("/v1/ok", Some(PRIVATE_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, get_request("/v1/boom", Some(PRIVATE_KEY))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let output = logs.contents();
    for path in ["/v1/ok", "/v1/boom"] {
        assert!(
            output
                .lines()
                .any(|line| line.contains(path) && line.contains("started processing request")),
            "no access-log line for {path}:\n{output}"
        );
    }
}

#[tokio::test]
async fn legacy_redirect_with_encoded_control_character_is_not_an_error() {
    let test_db = seeded_db();
    let reporter = Arc::new(RecordingReporter::default());
    let app = app(app_state(&test_db.db, test_config(&test_db.path), reporter.clone()));

    let (status, headers, _) = send(&app, get_request("/api/v1/a%0Ab", None)).await;
    assert_eq!(status, StatusCode::PERMANENT_REDIRECT);
    assert_eq!(headers.get(header::LOCATION).unwrap(), "/v1/a%0Ab");
    assert!(reporter.events().is_empty());
}

#[tokio::test]
async fn server_errors_are_reported_with_their_message() {
    let test_db = seeded_db();
    let reporter = Arc::new(RecordingReporter::default());
    let app = with_pipeline(
        Router::new().route("/v1/fail", get(failing_handler)),
        app_state(&test_db.db, test_config(&test_db.path), reporter.clone()),
    );

    let (status, _, body) = send(&app, get_request("/v1/fail", Some(PRIVATE_KEY))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "db exploded");

    let events = reporter.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ErrorKind::ServerError);
    assert_eq!(events[0].message, "db exploded");
}

#[tokio::test]
async fn client_errors_are_not_reported() {
    let test_db = seeded_db();
    let reporter = Arc::new(RecordingReporter::default());
    let app = app(app_state(&test_db.db, test_config(&test_db.path), reporter.clone()));

    let (status, _, _) = send(&app, get_request("/v1/projects", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = send(&app, get_request("/nope", Some(PRIVATE_KEY))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(reporter.events().is_empty());
}

#[tokio::test]
async fn unauthenticated_preflight_succeeds() {
    let test_db = seeded_db();
    let app = app(app_state(
        &test_db.db,
        test_config(&test_db.path),
        Arc::new(RecordingReporter::default()),
    ));

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/v1/projects")
        .header(header::ORIGIN, "https://app.lunary.ai")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "https://app.lunary.ai"
    );
}

#[tokio::test]
async fn missing_or_unknown_keys_are_unauthorized() {
    let test_db = seeded_db();
    let app = app(app_state(
        &test_db.db,
        test_config(&test_db.path),
        Arc::new(RecordingReporter::default()),
    ));

    let (status, _, body) = send(&app, get_request("/auth/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");

    let (status, _, _) = send(&app, get_request("/auth/me", Some("sk-unknown"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oversized_json_never_reaches_a_handler() {
    let test_db = seeded_db();
    let reached = Arc::new(AtomicBool::new(false));
    let flag = reached.clone();
    let routes = Router::new().route(
        "/v1/runs/ingest",
        post(move || {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                "ingested"
            }
        }),
    );
    let app = with_pipeline(
        routes,
        app_state(
            &test_db.db,
            test_config(&test_db.path),
            Arc::new(RecordingReporter::default()),
        ),
    );

    let padding = "x".repeat(5 * 1024 * 1024);
    let body = format!(r#"{{"id":"r1","type":"llm","name":"{padding}"}}"#);

    // Without a Content-Length header the limit trips while buffering.
    let request = Request::builder()
        .method("POST")
        .uri("/v1/runs/ingest")
        .header("authorization", format!("Bearer {PUBLIC_KEY}"))
        .header("content-type", "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    // With one, it trips before reading anything.
    let request = Request::builder()
        .method("POST")
        .uri("/v1/runs/ingest")
        .header("authorization", format!("Bearer {PUBLIC_KEY}"))
        .header("content-type", "application/json")
        .header("content-length", body.len())
        .body(Body::from(body))
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    assert!(!reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn oversized_ingest_stores_nothing() {
    let test_db = seeded_db();
    let app = app(app_state(
        &test_db.db,
        test_config(&test_db.path),
        Arc::new(RecordingReporter::default()),
    ));

    let padding = "x".repeat(5 * 1024 * 1024 + 1);
    let body = serde_json::json!([{ "id": "r1", "type": "llm", "name": padding }]);
    let (status, _, _) = send(
        &app,
        json_request("POST", "/v1/runs/ingest", Some(PUBLIC_KEY), &body),
    )
    .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(count_rows(&test_db.db, "run"), 0);
}

#[tokio::test]
async fn license_is_not_checked_when_hosted() {
    let test_db = seeded_db();
    let mut config = test_config(&test_db.path);
    config.deployment.self_hosted = false;
    config.deployment.license_key = None;
    let app = app(app_state(
        &test_db.db,
        config,
        Arc::new(RecordingReporter::default()),
    ));

    let (status, _, body) = send(&app, get_request("/auth/me", Some(PUBLIC_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["projectId"], "p1");
}

#[tokio::test]
async fn self_hosted_without_license_is_forbidden() {
    let test_db = seeded_db();
    let mut config = test_config(&test_db.path);
    config.deployment.self_hosted = true;
    config.deployment.license_key = None;
    let app = app(app_state(
        &test_db.db,
        config,
        Arc::new(RecordingReporter::default()),
    ));

    let (status, _, body) = send(&app, get_request("/auth/me", Some(PUBLIC_KEY))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "license invalid");

    let (status, _, _) = send(&app, get_request("/v1/health", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_rejects_excess_requests() {
    let test_db = seeded_db();
    let mut config = test_config(&test_db.path);
    config.limits.rate.default_limit = 2;
    let app = app(app_state(
        &test_db.db,
        config,
        Arc::new(RecordingReporter::default()),
    ));

    for i in 1..=3 {
        let (status, headers, _) = send(&app, get_request("/auth/me", Some(PUBLIC_KEY))).await;
        if i <= 2 {
            assert_eq!(status, StatusCode::OK, "request {i} should succeed");
        } else {
            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "request {i} should be limited");
            assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "60");
        }
    }

    // Limits are per project.
    let (status, _, _) = send(&app, get_request("/auth/me", Some(CAPPED_KEY))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn legacy_paths_redirect_without_credentials() {
    let test_db = seeded_db();
    let app = app(app_state(
        &test_db.db,
        test_config(&test_db.path),
        Arc::new(RecordingReporter::default()),
    ));

    let request = Request::builder()
        .method("POST")
        .uri("/api/report?source=sdk")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::PERMANENT_REDIRECT);
    assert_eq!(
        headers.get(header::LOCATION).unwrap(),
        "/v1/runs/ingest?source=sdk"
    );
}
