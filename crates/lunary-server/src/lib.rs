//! Lunary API server library logic.
//!
//! [`app`] assembles the request pipeline around the four route groups;
//! [`lifecycle`] owns process startup and shutdown.

pub mod api_auth;
pub mod api_redirections;
pub mod api_v1;
pub mod api_webhooks;
pub mod body;
pub mod config;
pub mod cors;
pub mod cron;
pub mod errors;
pub mod jobs;
pub mod license;
pub mod lifecycle;
pub mod middleware;

use axum::{
    extract::{DefaultBodyLimit, Request},
    middleware::{from_fn, from_fn_with_state},
    Extension, Router,
};
use config::Config;
use errors::ApiError;
use license::LicenseChecker;
use lunary_db::{Database, DbError};
use lunary_observe::ErrorReporter;
use middleware::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database handle (pool wrapper).
    pub db: Database,
    /// Sink for panics and 5xx responses.
    pub reporter: Arc<dyn ErrorReporter>,
    /// Rate limiter state.
    pub rate_limiter: RateLimiter,
    /// License verification, present only for self-hosted deployments.
    pub license: Option<Arc<LicenseChecker>>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds request state from configuration.
    ///
    /// The license checker is only constructed when the deployment is
    /// self-hosted.
    pub fn new(config: Arc<Config>, db: Database, reporter: Arc<dyn ErrorReporter>) -> Self {
        let rate_limiter = RateLimiter::new(Duration::from_secs(config.limits.rate.window_secs));
        let license = config
            .deployment
            .self_hosted
            .then(|| Arc::new(LicenseChecker::from_config(&config.deployment)));
        Self {
            db,
            reporter,
            rate_limiter,
            license,
            config,
        }
    }
}

/// Runs a database closure on the blocking pool.
pub(crate) async fn blocking_db<T, F>(db: &Database, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, DbError> + Send + 'static,
{
    let db = db.clone();
    let value = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        f(&conn)
    })
    .await??;
    Ok(value)
}

async fn not_found() -> ApiError {
    ApiError::NotFound("route not found".to_string())
}

/// The four route groups merged into one router, with a JSON 404 fallback.
pub fn route_groups() -> Router {
    Router::new()
        .merge(api_redirections::routes())
        .merge(api_v1::routes())
        .merge(api_auth::routes())
        .merge(api_webhooks::routes())
        .fallback(not_found)
}

/// Wraps `routes` in the request pipeline.
///
/// Layers run outermost first: error interception, access logging (a line on
/// arrival, so requests whose handler panics are still logged), CORS,
/// authentication, rate limiting, body parsing, default body, then licensing
/// (self-hosted only) right before dispatch. The order is load-bearing: CORS
/// answers preflights before auth, and rate limiting rejects callers before
/// their bodies are buffered.
pub fn with_pipeline(routes: Router, state: AppState) -> Router {
    let body_limits = state.config.limits.body;
    let cors = cors::cors_layer(&state.config.cors);
    let license = state.license.clone();
    let trust_proxy = state.config.server.trust_proxy;
    let state = Arc::new(state);

    let mut router = routes
        .layer(DefaultBodyLimit::max(body_limits.json.max(body_limits.text)))
        .layer(Extension(state.clone()));

    if let Some(checker) = license {
        router = router.layer(from_fn_with_state(checker, license::license_middleware));
    }

    router.layer(
        ServiceBuilder::new()
            .layer(from_fn_with_state(state.clone(), errors::error_middleware))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(move |req: &Request| {
                        tracing::info_span!(
                            "request",
                            method = %req.method(),
                            uri = %req.uri(),
                            scheme = %middleware::request_scheme(req, trust_proxy),
                            client_ip = ?middleware::client_ip(req, trust_proxy),
                        )
                    })
                    .on_request(DefaultOnRequest::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            )
            .layer(cors)
            .layer(from_fn_with_state(state.clone(), middleware::auth_middleware))
            .layer(from_fn_with_state(state, middleware::rate_limit_middleware))
            .layer(from_fn_with_state(body_limits, body::body_parser_middleware))
            .layer(from_fn(body::default_body_middleware)),
    )
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    with_pipeline(route_groups(), state)
}
