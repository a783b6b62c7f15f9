//! Error types for the error-reporting layer.

/// Errors that can occur while configuring or delivering error reports.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// The collector URL could not be parsed.
    #[error("invalid collector url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The collector could not be reached or rejected the report.
    #[error("collector request failed: {0}")]
    Delivery(#[from] reqwest::Error),
}
