//! Inbound webhooks.
//!
//! Deliveries are authenticated with an HMAC-SHA256 of the raw body, sent as
//! `X-Lunary-Signature: sha256=<hex>`, and recorded once per event id.

use axum::{
    body::Bytes,
    extract::Extension,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use hmac::{Hmac, Mac};
use lunary_db::record_webhook_event;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;

use crate::{blocking_db, errors::ApiError, AppState};

pub const SIGNATURE_HEADER: &str = "x-lunary-signature";

const BILLING_PROVIDER: &str = "billing";

pub fn routes() -> Router {
    Router::new().route("/webhooks/billing", post(billing_webhook_handler))
}

fn mac_for(secret: &[u8]) -> Result<Hmac<Sha256>, ApiError> {
    Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| ApiError::InternalServerError(format!("invalid webhook secret: {e}")))
}

/// Signature header value for `payload`.
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> Result<String, ApiError> {
    let mut mac = mac_for(secret)?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn verify_signature(secret: &[u8], headers: &HeaderMap, payload: &[u8]) -> Result<(), ApiError> {
    let invalid = || ApiError::BadRequest("invalid webhook signature".to_string());

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("sha256="))
        .ok_or_else(invalid)?;
    let provided = hex::decode(provided.trim()).map_err(|_| invalid())?;

    let mut mac = mac_for(secret)?;
    mac.update(payload);
    mac.verify_slice(&provided).map_err(|_| invalid())
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
}

async fn billing_webhook_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state
        .config
        .webhooks
        .secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::ServiceUnavailable("webhooks are not configured".to_string()))?;
    verify_signature(secret.as_bytes(), &headers, &payload)?;

    let envelope: WebhookEnvelope = serde_json::from_slice(&payload)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook payload: {e}")))?;
    let raw = String::from_utf8_lossy(&payload).into_owned();

    let event_id = envelope.id.clone();
    let event_type = envelope.event_type.clone();
    let inserted = blocking_db(&state.db, move |conn| {
        record_webhook_event(conn, BILLING_PROVIDER, &event_id, &event_type, &raw)
    })
    .await?;

    if inserted {
        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "recorded billing webhook"
        );
    } else {
        tracing::debug!(event_id = %envelope.id, "duplicate billing webhook ignored");
    }

    Ok(Json(json!({ "received": true, "duplicate": !inserted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, signature.parse().unwrap());
        headers
    }

    #[test]
    fn valid_signature_verifies() {
        let payload = br#"{"id":"evt_1","type":"invoice.paid"}"#;
        let signature = sign_payload(b"whsec", payload).unwrap();
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature(b"whsec", &headers_with(&signature), payload).is_ok());
    }

    #[test]
    fn tampered_payload_or_wrong_secret_fails() {
        let signature = sign_payload(b"whsec", b"original").unwrap();
        assert!(verify_signature(b"whsec", &headers_with(&signature), b"tampered").is_err());
        assert!(verify_signature(b"other", &headers_with(&signature), b"original").is_err());
    }

    #[test]
    fn malformed_headers_fail() {
        assert!(verify_signature(b"whsec", &HeaderMap::new(), b"x").is_err());
        assert!(verify_signature(b"whsec", &headers_with("md5=abcd"), b"x").is_err());
        assert!(verify_signature(b"whsec", &headers_with("sha256=zz"), b"x").is_err());
    }
}
