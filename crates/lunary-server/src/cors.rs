//! Cross-origin policy.

use axum::http::{header, HeaderName, HeaderValue, Method};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::CorsConfig;

const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("x-lunary-signature");

/// Builds the CORS layer.
///
/// With no configured origins the request origin is mirrored back, which
/// keeps credentialed requests working for the dashboard on any host.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origin = if config.allowed_origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            SIGNATURE_HEADER,
        ])
        .allow_credentials(true)
        .max_age(Duration::from_secs(config.max_age_secs))
}
