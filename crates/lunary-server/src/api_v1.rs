//! Versioned API routes (`/v1`).

use axum::{
    extract::{Extension, Query},
    routing::{get, post},
    Json, Router,
};
use lunary_db::{daily_usage, insert_runs, list_projects, org_is_limited, KeyKind, NewRun};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{blocking_db, body::RequestBody, errors::ApiError, middleware::Identity, AppState};

const DEFAULT_USAGE_DAYS: u32 = 30;
const MAX_USAGE_DAYS: u32 = 365;

pub fn routes() -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/runs/ingest", post(ingest_handler))
        .route("/v1/projects", get(list_projects_handler))
        .route("/v1/analytics/usage", get(usage_handler))
}

/// Health check handler.
///
/// Returns `200 OK` with server status and version. Used by load balancers,
/// monitoring, and CI to verify the server is running.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Accepts a bare array of events, `{ "events": [...] }`, or a single event.
fn parse_events(body: Value) -> Result<Vec<NewRun>, ApiError> {
    let events = match body {
        Value::Array(events) => events,
        Value::Object(mut map) => match map.remove("events") {
            Some(Value::Array(events)) => events,
            Some(_) => {
                return Err(ApiError::BadRequest(
                    "`events` must be an array".to_string(),
                ))
            }
            None => vec![Value::Object(map)],
        },
        _ => {
            return Err(ApiError::BadRequest(
                "expected an event or an array of events".to_string(),
            ))
        }
    };

    events
        .into_iter()
        .enumerate()
        .map(|(i, event)| {
            serde_json::from_value(event)
                .map_err(|e| ApiError::BadRequest(format!("invalid event at index {i}: {e}")))
        })
        .collect()
}

async fn ingest_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    RequestBody(body): RequestBody,
) -> Result<Json<Value>, ApiError> {
    let runs = parse_events(body)?;
    if runs.is_empty() {
        return Ok(Json(json!({ "ingested": 0 })));
    }

    let project_id = identity.project_id;
    let ingested = blocking_db(&state.db, move |conn| {
        if org_is_limited(conn, &project_id)? {
            return Ok(None);
        }
        insert_runs(conn, &project_id, &runs).map(Some)
    })
    .await?
    .ok_or_else(|| {
        ApiError::Forbidden("organization has reached its daily event limit".to_string())
    })?;

    tracing::debug!(ingested, "ingested run events");
    Ok(Json(json!({ "ingested": ingested })))
}

fn require_private(identity: &Identity) -> Result<(), ApiError> {
    match identity.kind {
        KeyKind::Private => Ok(()),
        KeyKind::Public => Err(ApiError::Forbidden(
            "this endpoint requires a private API key".to_string(),
        )),
    }
}

async fn list_projects_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Value>, ApiError> {
    require_private(&identity)?;
    let org_id = identity.org_id;
    let projects = blocking_db(&state.db, move |conn| list_projects(conn, org_id)).await?;
    Ok(Json(json!({ "projects": projects })))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    days: Option<u32>,
}

async fn usage_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Value>, ApiError> {
    require_private(&identity)?;
    let days = query
        .days
        .unwrap_or(DEFAULT_USAGE_DAYS)
        .clamp(1, MAX_USAGE_DAYS);
    let project_id = identity.project_id;
    let usage = blocking_db(&state.db, move |conn| daily_usage(conn, &project_id, days)).await?;
    Ok(Json(json!({ "days": days, "usage": usage })))
}
