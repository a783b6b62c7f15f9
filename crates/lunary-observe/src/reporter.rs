//! Error reporters.
//!
//! Reporting must never block or fail a request, so [`CollectorReporter`]
//! hands events to a bounded queue drained by a background task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use crate::{ErrorEvent, ObserveError};

/// Events buffered for delivery before new ones are dropped.
const QUEUE_CAPACITY: usize = 256;

/// Per-request timeout when posting to the collector.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sink for request-handling failures.
pub trait ErrorReporter: Send + Sync + 'static {
    /// Reports an event. Must return promptly.
    fn report(&self, event: ErrorEvent);
}

/// Logs events through `tracing` only. Used when no collector is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, event: ErrorEvent) {
        tracing::error!(
            event_id = %event.id,
            kind = ?event.kind,
            method = %event.method,
            path = %event.path,
            status = event.status,
            "{}",
            event.message
        );
    }
}

/// Forwards events to an HTTP collector as JSON.
#[derive(Debug, Clone)]
pub struct CollectorReporter {
    tx: mpsc::Sender<ErrorEvent>,
    endpoint: Url,
}

impl CollectorReporter {
    /// Starts the delivery task. Must be called from within a Tokio runtime.
    pub fn spawn(endpoint: Url) -> Result<Self, ObserveError> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self::with_client(endpoint, client))
    }

    /// Starts the delivery task with a caller-provided HTTP client.
    pub fn with_client(endpoint: Url, client: reqwest::Client) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(deliver(rx, client, endpoint.clone()));
        tracing::info!(collector = %endpoint, "error collector reporting enabled");
        Self { tx, endpoint }
    }

    /// The collector endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl ErrorReporter for CollectorReporter {
    fn report(&self, event: ErrorEvent) {
        TracingReporter.report(event.clone());
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event_id = %event.id, "error report queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(
                    event_id = %event.id,
                    "error collector task stopped, dropping event"
                );
            }
        }
    }
}

async fn deliver(mut rx: mpsc::Receiver<ErrorEvent>, client: reqwest::Client, endpoint: Url) {
    while let Some(event) = rx.recv().await {
        let result = client
            .post(endpoint.clone())
            .json(&event)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(e) = result {
            tracing::warn!(event_id = %event.id, error = %e, "failed to deliver error report");
        }
    }
    tracing::debug!("error collector delivery task finished");
}

/// Builds the reporter for an optional collector URL.
///
/// `None` or an empty string yields a [`TracingReporter`].
pub fn reporter_from_url(url: Option<&str>) -> Result<Arc<dyn ErrorReporter>, ObserveError> {
    match url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => Ok(Arc::new(CollectorReporter::spawn(Url::parse(url)?)?)),
        None => Ok(Arc::new(TracingReporter)),
    }
}
