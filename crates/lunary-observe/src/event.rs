//! Error event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of failure produced an [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A handler or middleware panicked.
    Panic,
    /// A handler returned a 5xx error.
    ServerError,
}

/// A request-handling failure forwarded to the error collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub message: String,
}

impl ErrorEvent {
    /// Creates an event stamped with a fresh id and the current time.
    pub fn new(
        kind: ErrorKind,
        method: impl Into<String>,
        path: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            kind,
            method: method.into(),
            path: path.into(),
            status,
            message: message.into(),
        }
    }
}
