//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Deployment mode and licensing.
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Cross-origin policy.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Body size ceilings and rate limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Background job settings.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Error reporting.
    #[serde(default)]
    pub observe: ObserveConfig,

    /// Inbound webhook settings.
    #[serde(default)]
    pub webhooks: WebhookConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Read client IP and protocol from `X-Forwarded-*` headers.
    #[serde(default = "default_true")]
    pub trust_proxy: bool,

    /// How long in-flight requests may run after shutdown begins.
    #[serde(default = "default_drain_secs")]
    pub shutdown_grace_secs: u64,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long a checkout waits for a connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on waiting for checked-out connections at shutdown.
    #[serde(default = "default_drain_secs")]
    pub drain_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "lunary_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Runtime environment, read from `NODE_ENV`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
    Test,
}

impl Environment {
    /// Parses a `NODE_ENV` value, case-sensitively and untrimmed. Anything
    /// unrecognised is development.
    pub fn from_node_env(value: &str) -> Self {
        match value {
            "production" => Environment::Production,
            "test" => Environment::Test,
            _ => Environment::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// Deployment mode.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub environment: Environment,

    /// Customer-operated install; enables license enforcement.
    #[serde(default)]
    pub self_hosted: bool,

    #[serde(default)]
    pub license_key: Option<String>,

    #[serde(default = "default_license_server_url")]
    pub license_server_url: String,
}

/// Cross-origin policy.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Empty means the request origin is mirrored.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_cors_max_age_secs")]
    pub max_age_secs: u64,
}

/// Request body ceilings, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BodyLimits {
    #[serde(default = "default_json_limit")]
    pub json: usize,

    #[serde(default = "default_text_limit")]
    pub text: usize,

    #[serde(default = "default_form_limit")]
    pub form: usize,
}

/// Requests allowed per caller per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,

    /// Limit for `POST /v1/runs/ingest`.
    #[serde(default = "default_ingest_limit")]
    pub ingest_limit: u32,

    /// Limit for every other route.
    #[serde(default = "default_rate_limit")]
    pub default_limit: u32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub body: BodyLimits,

    #[serde(default)]
    pub rate: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_mv_refresh_secs")]
    pub materialized_view_refresh_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObserveConfig {
    /// Error collector endpoint. Errors are only logged when unset.
    #[serde(default)]
    pub collector_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// HMAC secret for `X-Lunary-Signature`.
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    3333
}

fn default_true() -> bool {
    true
}

fn default_drain_secs() -> u64 {
    5
}

fn default_db_path() -> String {
    "lunary.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_license_server_url() -> String {
    "https://api.lunary.ai".to_string()
}

fn default_cors_max_age_secs() -> u64 {
    86_400
}

fn default_json_limit() -> usize {
    5 * 1024 * 1024
}

fn default_text_limit() -> usize {
    5 * 1024 * 1024
}

fn default_form_limit() -> usize {
    56 * 1024
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_ingest_limit() -> u32 {
    1_000
}

fn default_rate_limit() -> u32 {
    300
}

fn default_mv_refresh_secs() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trust_proxy: true,
            shutdown_grace_secs: default_drain_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            drain_timeout_secs: default_drain_secs(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> lunary_db::DbRuntimeSettings {
        lunary_db::DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
            connect_timeout_ms: self.connect_timeout_ms,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            self_hosted: false,
            license_key: None,
            license_server_url: default_license_server_url(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_age_secs: default_cors_max_age_secs(),
        }
    }
}

impl Default for BodyLimits {
    fn default() -> Self {
        Self {
            json: default_json_limit(),
            text: default_text_limit(),
            form: default_form_limit(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window_secs(),
            ingest_limit: default_ingest_limit(),
            default_limit: default_rate_limit(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            materialized_view_refresh_secs: default_mv_refresh_secs(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies overrides from the process environment.
///
/// Environment variable overrides:
/// - `NODE_ENV` overrides `deployment.environment`
/// - `PORT` overrides `server.port` (ignored unless it parses as a port)
/// - `LUNARY_HOST` overrides `server.host`
/// - `LUNARY_DB_PATH` overrides `database.path`
/// - `LUNARY_LOG_LEVEL` overrides `logging.level`
/// - `LUNARY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `IS_SELF_HOSTED` overrides `deployment.self_hosted`
/// - `LICENSE_KEY` overrides `deployment.license_key`
/// - `LICENSE_SERVER_URL` overrides `deployment.license_server_url`
/// - `ALLOWED_ORIGINS` (comma separated) overrides `cors.allowed_origins`
/// - `ERROR_COLLECTOR_URL` overrides `observe.collector_url`
/// - `WEBHOOK_SECRET` overrides `webhooks.secret`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`], reading overrides through `env` instead of the
/// process environment.
pub fn load_config_with_env(
    path: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, env);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if let Some(node_env) = env("NODE_ENV") {
        config.deployment.environment = Environment::from_node_env(&node_env);
    }
    if let Some(port) = env("PORT") {
        match port.trim().parse() {
            Ok(parsed) => config.server.port = parsed,
            Err(_) => tracing::warn!(value = %port, "ignoring invalid PORT"),
        }
    }
    if let Some(host) = env("LUNARY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(db_path) = env("LUNARY_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = env("LUNARY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = env("LUNARY_LOG_JSON") {
        config.logging.json = is_truthy(&json);
    }
    if let Some(self_hosted) = env("IS_SELF_HOSTED") {
        config.deployment.self_hosted = is_truthy(&self_hosted);
    }
    if let Some(key) = env("LICENSE_KEY").filter(|k| !k.trim().is_empty()) {
        config.deployment.license_key = Some(key);
    }
    if let Some(url) = env("LICENSE_SERVER_URL") {
        config.deployment.license_server_url = url;
    }
    if let Some(origins) = env("ALLOWED_ORIGINS") {
        config.cors.allowed_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(url) = env("ERROR_COLLECTOR_URL") {
        config.observe.collector_url = Some(url);
    }
    if let Some(secret) = env("WEBHOOK_SECRET") {
        config.webhooks.secret = Some(secret);
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "true" | "1")
}
