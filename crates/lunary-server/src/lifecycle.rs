//! Process startup and shutdown.
//!
//! Startup runs strictly in order, each step a precondition for the next:
//! database liveness and migrations, cron registration, the production-only
//! materialized-view job, then the listener. Shutdown is an explicit routine
//! on [`RunningServer`] so it can be driven by a signal handler or a test.

use axum::Router;
use lunary_db::{run_migrations, Database, DbError, DrainOutcome, MigrationError};
use lunary_observe::ErrorReporter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinError, JoinHandle};

use crate::{
    app,
    config::Config,
    cron::{setup_cron_jobs, JobScheduler},
    jobs::start_materialized_view_refresh,
    AppState,
};

/// Exit code after a graceful shutdown. Non-zero, so supervisors treat every
/// exit alike.
pub const SHUTDOWN_EXIT_CODE: i32 = 1;

/// Fatal errors before the server starts serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database unreachable: {0}")]
    Database(#[from] DbError),

    #[error("failed to run database migrations: {0}")]
    Migration(#[from] MigrationError),

    #[error("startup task failed: {0}")]
    Join(#[from] JoinError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Everything constructed once at startup and needed again at shutdown.
pub struct AppContext {
    pub config: Arc<Config>,
    pub db: Database,
    pub reporter: Arc<dyn ErrorReporter>,
    pub scheduler: JobScheduler,
    /// Present only in production.
    pub materialized_view_job: Option<JoinHandle<()>>,
    /// Fired once at shutdown; every background job subscribes.
    pub shutdown: broadcast::Sender<()>,
}

impl AppContext {
    /// Request state for the HTTP application.
    pub fn app_state(&self) -> AppState {
        AppState::new(self.config.clone(), self.db.clone(), self.reporter.clone())
    }

    /// Stops cron jobs and the materialized-view job, waiting at most
    /// `timeout` for each group.
    async fn stop_background(&mut self, timeout: Duration) {
        self.scheduler.stop(timeout).await;
        if let Some(mut job) = self.materialized_view_job.take() {
            if tokio::time::timeout(timeout, &mut job).await.is_err() {
                tracing::warn!("materialized view job did not stop in time, aborting");
                job.abort();
            }
        }
    }
}

/// Establishes every precondition for serving, without binding a listener.
pub async fn bootstrap(
    config: Config,
    reporter: Arc<dyn ErrorReporter>,
) -> Result<AppContext, StartupError> {
    let config = Arc::new(config);
    let db = Database::open(&config.database.path, config.database.runtime_settings());

    let check = db.clone();
    let applied = tokio::task::spawn_blocking(move || -> Result<Vec<&'static str>, StartupError> {
        check.check_connection()?;
        let conn = check.get()?;
        Ok(run_migrations(&conn)?)
    })
    .await??;
    tracing::info!(path = %config.database.path, "database connection verified");
    if !applied.is_empty() {
        tracing::info!(migrations = ?applied, "applied database migrations");
    }

    let (shutdown, _) = broadcast::channel(1);
    let scheduler = JobScheduler::new(db.clone(), shutdown.clone());
    let registered = setup_cron_jobs(&scheduler);
    tracing::debug!(registered, "cron jobs set up");

    let materialized_view_job = if config.deployment.environment.is_production() {
        let period = Duration::from_secs(config.jobs.materialized_view_refresh_secs.max(1));
        Some(start_materialized_view_refresh(
            db.clone(),
            period,
            shutdown.subscribe(),
        ))
    } else {
        tracing::info!(
            environment = ?config.deployment.environment,
            "materialized view refresh disabled outside production"
        );
        None
    };

    Ok(AppContext {
        config,
        db,
        reporter,
        scheduler,
        materialized_view_job,
        shutdown,
    })
}

/// Outcome of [`RunningServer::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub exit_code: i32,
    pub db_drain: DrainOutcome,
    /// Bound applied to the database drain.
    pub drain_timeout: Duration,
    /// Whether in-flight requests finished within the grace period.
    pub server_drained: bool,
}

/// A bound, serving server.
pub struct RunningServer {
    local_addr: SocketAddr,
    context: AppContext,
    stop: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Shuts down: stops background jobs, drains the database within its
    /// bound, stops accepting connections, and waits for in-flight requests
    /// within the grace period.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!("Shutting down server...");
        let RunningServer {
            mut context,
            stop,
            mut server,
            ..
        } = self;
        let grace = context.config.server.shutdown_grace();

        context.stop_background(grace).await;

        let drain_timeout = context.config.database.drain_timeout();
        let db = context.db.clone();
        let db_drain = tokio::task::spawn_blocking(move || db.close(drain_timeout))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "database close task failed");
                DrainOutcome::AlreadyClosed
            });

        let _ = stop.send(());
        let server_drained = match tokio::time::timeout(grace, &mut server).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                tracing::error!(error = %e, "server exited with error");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "server task panicked");
                true
            }
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "in-flight requests did not finish in time, aborting"
                );
                server.abort();
                false
            }
        };

        tracing::info!(exit_code = SHUTDOWN_EXIT_CODE, ?db_drain, "server shut down");
        ShutdownReport {
            exit_code: SHUTDOWN_EXIT_CODE,
            db_drain,
            drain_timeout,
            server_drained,
        }
    }
}

/// Binds `router` and serves it until [`RunningServer::shutdown`].
pub async fn serve(context: AppContext, router: Router) -> Result<RunningServer, StartupError> {
    let addr = SocketAddr::new(context.config.server.host, context.config.server.port);
    let bound = TcpListener::bind(addr)
        .await
        .and_then(|listener| Ok((listener.local_addr()?, listener)));
    let (local_addr, listener) = match bound {
        Ok(bound) => bound,
        Err(source) => {
            let _ = context.shutdown.send(());
            return Err(StartupError::Bind { addr, source });
        }
    };

    tracing::info!(%local_addr, "Lunary API server listening on port {}", local_addr.port());

    let (stop, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        })
        .await
    });

    Ok(RunningServer {
        local_addr,
        context,
        stop,
        server,
    })
}

/// Runs the full startup sequence and starts serving the application.
pub async fn start(
    config: Config,
    reporter: Arc<dyn ErrorReporter>,
) -> Result<RunningServer, StartupError> {
    let context = bootstrap(config, reporter).await?;
    let router = app(context.app_state());
    serve(context, router).await
}
