//! Lunary API server binary.
//!
//! Loads configuration, initializes structured logging, runs the startup
//! sequence, and shuts down on SIGTERM/SIGINT.

use lunary_observe::{reporter_from_url, ErrorReporter, TracingReporter};
use lunary_server::{config, lifecycle};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("LUNARY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration: the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        environment = ?config.deployment.environment,
        self_hosted = config.deployment.self_hosted,
        "resolved startup configuration path"
    );

    let reporter: Arc<dyn ErrorReporter> =
        match reporter_from_url(config.observe.collector_url.as_deref()) {
            Ok(reporter) => reporter,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "invalid error collector URL, errors will only be logged"
                );
                Arc::new(TracingReporter)
            }
        };

    let server = match lifecycle::start(config, reporter).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start Lunary API server");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    let report = server.shutdown().await;
    std::process::exit(report.exit_code);
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
