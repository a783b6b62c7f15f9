//! Auth routes: current identity and API key verification.

use axum::{
    extract::Extension,
    routing::{get, post},
    Json, Router,
};
use lunary_db::{find_api_key, KeyKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{blocking_db, body::RequestBody, errors::ApiError, middleware::Identity, AppState};

pub fn routes() -> Router {
    Router::new()
        .route("/auth/me", get(me_handler))
        .route("/auth/api-keys/verify", post(verify_key_handler))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    project_id: String,
    org_id: i64,
    kind: KeyKind,
}

async fn me_handler(Extension(identity): Extension<Identity>) -> Json<MeResponse> {
    Json(MeResponse {
        project_id: identity.project_id,
        org_id: identity.org_id,
        kind: identity.kind,
    })
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    key: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<KeyKind>,
}

/// Checks whether a key exists without authenticating the caller.
async fn verify_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    RequestBody(body): RequestBody,
) -> Result<Json<VerifyResponse>, ApiError> {
    let VerifyRequest { key } = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("expected {{\"key\": string}}: {e}")))?;
    if key.trim().is_empty() {
        return Err(ApiError::BadRequest("key must not be empty".to_string()));
    }

    let record = blocking_db(&state.db, move |conn| find_api_key(conn, key.trim())).await?;
    Ok(Json(match record {
        Some(record) => VerifyResponse {
            valid: true,
            project_id: Some(record.project_id),
            kind: Some(record.kind),
        },
        None => VerifyResponse {
            valid: false,
            project_id: None,
            kind: None,
        },
    }))
}
