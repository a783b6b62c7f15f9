//! API error type and the outermost error-interception middleware.

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::FutureExt;
use lunary_db::DbError;
use lunary_observe::{ErrorEvent, ErrorKind};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

use crate::AppState;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("too many requests")]
    TooManyRequests { retry_after_secs: u64 },
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

/// Message of a 5xx response, attached as a response extension so the error
/// middleware can report it.
#[derive(Debug, Clone)]
pub struct ErrorMessage(pub String);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::ServiceUnavailable(msg)
            | ApiError::InternalServerError(msg) => msg.clone(),
            ApiError::TooManyRequests { .. } => "Too many requests, retry later".to_string(),
        };

        let body = Json(serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": message,
        }));
        let mut response = (status, body).into_response();

        if let ApiError::TooManyRequests { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if status.is_server_error() {
            response.extensions_mut().insert(ErrorMessage(message));
        }
        response
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Closed => ApiError::ServiceUnavailable("server is shutting down".to_string()),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::InternalServerError(format!("background task failed: {err}"))
    }
}

/// Outermost middleware: turns panics into 500 responses and reports every
/// panic and 5xx response to the error reporter.
///
/// Nothing raised while handling a request escapes this layer.
pub async fn error_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => {
            let status = response.status();
            if status.is_server_error() {
                let message = response
                    .extensions()
                    .get::<ErrorMessage>()
                    .map(|m| m.0.clone())
                    .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
                state.reporter.report(ErrorEvent::new(
                    ErrorKind::ServerError,
                    method,
                    path,
                    status.as_u16(),
                    message,
                ));
            }
            response
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            state.reporter.report(ErrorEvent::new(
                ErrorKind::Panic,
                method,
                path,
                StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                message,
            ));
            ApiError::InternalServerError("Internal Server Error".to_string()).into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}
