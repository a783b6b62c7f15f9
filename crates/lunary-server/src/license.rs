//! License enforcement for self-hosted deployments.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{config::DeploymentConfig, errors::ApiError};

/// How long a successful verification is trusted.
const VALID_TTL: Duration = Duration::from_secs(60 * 60);

/// How long an invalid or failed verification is trusted before retrying.
const RETRY_TTL: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("license server request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct LicenseResponse {
    valid: bool,
}

#[derive(Debug, Clone, Copy)]
struct Verdict {
    valid: bool,
    expires_at: Instant,
}

/// Verifies the configured license key against the license server and caches
/// the verdict.
#[derive(Debug)]
pub struct LicenseChecker {
    client: reqwest::Client,
    server_url: String,
    key: Option<String>,
    cache: RwLock<Option<Verdict>>,
}

impl LicenseChecker {
    pub fn new(server_url: impl Into<String>, key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build license client, using defaults");
                reqwest::Client::new()
            });
        Self {
            client,
            server_url: server_url.into(),
            key: key.filter(|k| !k.trim().is_empty()),
            cache: RwLock::new(None),
        }
    }

    pub fn from_config(config: &DeploymentConfig) -> Self {
        Self::new(config.license_server_url.clone(), config.license_key.clone())
    }

    /// Whether the license is currently valid.
    ///
    /// A missing key is invalid without contacting the server. When the
    /// server cannot be reached, the last known verdict stands.
    pub async fn is_valid(&self) -> bool {
        let Some(key) = self.key.as_deref() else {
            return false;
        };

        if let Some(verdict) = *self.cache.read().await {
            if verdict.expires_at > Instant::now() {
                return verdict.valid;
            }
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(verdict) = *cache {
            if verdict.expires_at > Instant::now() {
                return verdict.valid;
            }
        }

        let valid = match self.fetch(key).await {
            Ok(valid) => {
                if !valid {
                    tracing::warn!("license server rejected the configured license key");
                }
                valid
            }
            Err(e) => {
                let last_known = (*cache).map(|v| v.valid).unwrap_or(false);
                tracing::warn!(error = %e, last_known, "license verification failed");
                last_known
            }
        };

        let ttl = if valid { VALID_TTL } else { RETRY_TTL };
        *cache = Some(Verdict {
            valid,
            expires_at: Instant::now() + ttl,
        });
        valid
    }

    async fn fetch(&self, key: &str) -> Result<bool, LicenseError> {
        let url = format!(
            "{}/v1/licenses/{}",
            self.server_url.trim_end_matches('/'),
            key
        );
        let response: LicenseResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.valid)
    }
}

/// Rejects requests with 403 while the license is invalid. Health checks
/// stay reachable so orchestrators can still probe the process.
pub async fn license_middleware(
    State(checker): State<Arc<LicenseChecker>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if req.uri().path() == "/v1/health" || checker.is_valid().await {
        return Ok(next.run(req).await);
    }
    Err(ApiError::Forbidden("license invalid".to_string()))
}
