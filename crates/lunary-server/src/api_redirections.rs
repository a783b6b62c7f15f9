//! Legacy paths, permanently redirected to their current location.
//!
//! 308 keeps the method and body, so old SDKs posting to `/api/report` land
//! on the ingest endpoint unchanged.

use axum::{http::Uri, response::Redirect, routing::any, Router};

pub fn routes() -> Router {
    Router::new()
        .route("/api/report", any(report_redirect))
        .route("/api/v1/{*rest}", any(v1_redirect))
}

fn with_query(path: String, uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    }
}

async fn report_redirect(uri: Uri) -> Redirect {
    Redirect::permanent(&with_query("/v1/runs/ingest".to_string(), &uri))
}

/// Keeps the raw, still percent-encoded path so the `Location` value is
/// always a valid header.
async fn v1_redirect(uri: Uri) -> Redirect {
    let path = uri.path().strip_prefix("/api").unwrap_or(uri.path());
    Redirect::permanent(&with_query(path.to_string(), &uri))
}
