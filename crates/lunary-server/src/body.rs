//! Request body parsing and default-body normalization.
//!
//! Bodies are buffered and parsed here, before routing, so an oversized or
//! malformed payload never reaches a handler. Handlers read the parsed body
//! through the [`RequestBody`] extractor.

use axum::{
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use serde_json::{Map, Value};
use std::convert::Infallible;

use crate::{config::BodyLimits, errors::ApiError};

/// Parsed request payload.
///
/// JSON bodies hold the decoded value, text bodies a JSON string and
/// urlencoded forms a JSON object of strings. After
/// [`default_body_middleware`] an absent body is an empty object.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBody(pub Value);

impl<S: Send + Sync> FromRequestParts<S> for RequestBody {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestBody>()
            .cloned()
            .unwrap_or_else(|| RequestBody(Value::Object(Map::new()))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    Text,
    Form,
}

impl BodyKind {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "application/json" || mime.ends_with("+json") {
            Some(BodyKind::Json)
        } else if mime == "text/plain" {
            Some(BodyKind::Text)
        } else if mime == "application/x-www-form-urlencoded" {
            Some(BodyKind::Form)
        } else {
            None
        }
    }

    fn limit(self, limits: &BodyLimits) -> usize {
        match self {
            BodyKind::Json => limits.json,
            BodyKind::Text => limits.text,
            BodyKind::Form => limits.form,
        }
    }
}

fn too_large(limit: usize) -> ApiError {
    ApiError::PayloadTooLarge(format!("request body exceeds {limit} bytes"))
}

/// Buffers and parses JSON, text and urlencoded bodies within their ceilings.
///
/// The buffered bytes are put back on the request, so handlers that need the
/// raw payload (signature checks) can still read it.
pub async fn body_parser_middleware(
    State(limits): State<BodyLimits>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(kind) = BodyKind::from_headers(req.headers()) else {
        return Ok(next.run(req).await);
    };
    let limit = kind.limit(&limits);

    let declared_len = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > limit) {
        return Err(too_large(limit));
    }

    let (mut parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| too_large(limit))?;

    if !bytes.is_empty() {
        let parsed = match kind {
            BodyKind::Json => serde_json::from_slice::<Value>(&bytes)
                .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?,
            BodyKind::Text => Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| ApiError::BadRequest("text body is not UTF-8".to_string()))?,
            ),
            BodyKind::Form => Value::Object(
                url::form_urlencoded::parse(&bytes)
                    .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                    .collect(),
            ),
        };
        parts.extensions.insert(RequestBody(parsed));
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

/// Ensures handlers always see a body: absent or unparsed bodies become `{}`.
pub async fn default_body_middleware(mut req: Request, next: Next) -> Response {
    if req.extensions().get::<RequestBody>().is_none() {
        req.extensions_mut()
            .insert(RequestBody(Value::Object(Map::new())));
    }
    next.run(req).await
}
