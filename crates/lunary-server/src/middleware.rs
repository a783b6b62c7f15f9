use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use lunary_db::{find_api_key, KeyKind};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::{blocking_db, errors::ApiError, AppState};

/// Paths served without credentials. Entries ending in `/` match as prefixes.
const PUBLIC_PATHS: &[&str] = &[
    "/v1/health",
    "/auth/api-keys/verify",
    "/webhooks/",
    "/api/",
];

/// Caller identity resolved from a project API key, stored in request
/// extensions by [`auth_middleware`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub project_id: String,
    pub org_id: i64,
    pub kind: KeyKind,
}

pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.iter().any(|public| {
        if public.ends_with('/') {
            path.starts_with(public)
        } else {
            path == *public
        }
    })
}

/// Extracts the token of an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::Unauthorized("malformed Authorization header".to_string()))?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(Some(token.trim().to_string())),
        _ => Err(ApiError::Unauthorized(
            "expected Authorization: Bearer <api key>".to_string(),
        )),
    }
}

/// Middleware to authenticate requests via `Authorization: Bearer <api key>`.
///
/// Public paths pass through untouched. Every other path requires a known
/// project API key; the resolved [`Identity`] is inserted into extensions for
/// the rate limiter and handlers.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if is_public_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let token = bearer_token(req.headers())?
        .ok_or_else(|| ApiError::Unauthorized("missing API key".to_string()))?;

    let record = blocking_db(&state.db, move |conn| find_api_key(conn, &token))
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid API key".to_string()))?;

    req.extensions_mut().insert(Identity {
        project_id: record.project_id,
        org_id: record.org_id,
        kind: record.kind,
    });

    Ok(next.run(req).await)
}

/// Client address, honouring `X-Forwarded-For` / `X-Real-IP` when the
/// server sits behind a trusted proxy.
pub fn client_ip(req: &Request, trust_proxy: bool) -> Option<IpAddr> {
    if trust_proxy {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
        let real_ip = req
            .headers()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        if real_ip.is_some() {
            return real_ip;
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Request scheme, honouring `X-Forwarded-Proto` behind a trusted proxy.
pub fn request_scheme(req: &Request, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(proto) = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return proto.to_ascii_lowercase();
        }
    }
    req.uri().scheme_str().unwrap_or("http").to_string()
}

/// Rate limiting key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Rate limit by authenticated project.
    Project(String),
    /// Rate limit by client IP address.
    Ip(IpAddr),
    /// No identity and no peer address (e.g. in-process callers).
    Anonymous,
}

/// In-memory rate limiter state.
///
/// Uses a simple fixed window counter.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    window: Duration,
    state: Arc<Mutex<HashMap<RateLimitKey, (u32, Instant)>>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Counts a request against `key`.
    ///
    /// When the limit is exceeded, returns the time left in the caller's
    /// current window.
    pub fn check(&self, key: RateLimitKey, limit: u32) -> Result<(), Duration> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // A stale counter beats refusing every request.
                tracing::error!("rate limiter lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        };
        let now = Instant::now();

        // Evict expired windows only; clearing everything would reset active limits.
        if state.len() > 10000 {
            let window = self.window;
            state.retain(|_, (_, start)| now.duration_since(*start) <= window);
        }

        let (count, start) = state.entry(key).or_insert((0, now));

        let elapsed = now.duration_since(*start);
        if elapsed > self.window {
            *count = 1;
            *start = now;
            Ok(())
        } else {
            *count += 1;
            if *count <= limit {
                Ok(())
            } else {
                Err(self.window - elapsed)
            }
        }
    }
}

/// Whole seconds to wait, rounded up and never zero.
fn retry_after_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    secs.max(1)
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Rate limiting middleware.
///
/// Keys on the authenticated project when [`auth_middleware`] resolved one,
/// otherwise on the client IP.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = if let Some(identity) = req.extensions().get::<Identity>() {
        RateLimitKey::Project(identity.project_id.clone())
    } else if let Some(ip) = client_ip(&req, state.config.server.trust_proxy) {
        RateLimitKey::Ip(ip)
    } else {
        RateLimitKey::Anonymous
    };

    let limits = state.config.limits.rate;
    let limit = if req.uri().path() == "/v1/runs/ingest" {
        limits.ingest_limit
    } else {
        limits.default_limit
    };

    if let Err(remaining) = state.rate_limiter.check(key, limit) {
        return Err(ApiError::TooManyRequests {
            retry_after_secs: retry_after_secs(remaining),
        });
    }

    Ok(next.run(req).await)
}
