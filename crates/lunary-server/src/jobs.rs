//! Materialized-view refresh job.

use lunary_db::{refresh_materialized_views, Database, DbError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Starts the materialized-view refresh task.
///
/// The first refresh runs immediately, then every `period`. A slow refresh
/// delays the next one instead of stacking. The task ends on the shutdown
/// broadcast or once the database is closed.
pub fn start_materialized_view_refresh(
    db: Database,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tracing::info!(
        interval_secs = period.as_secs(),
        "starting materialized view refresh job"
    );

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    tracing::info!("materialized view job received shutdown signal, exiting loop");
                    break;
                }
            }

            let db = db.clone();
            let result = tokio::task::spawn_blocking(move || {
                let conn = db.get()?;
                refresh_materialized_views(&conn)
            })
            .await;

            match result {
                Ok(Ok(refreshed)) => {
                    for view in refreshed {
                        tracing::debug!(
                            view = view.name,
                            rows = view.rows,
                            "refreshed materialized view"
                        );
                    }
                }
                Ok(Err(DbError::Closed)) => {
                    tracing::debug!("database closed, stopping materialized view job");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "failed to refresh materialized views");
                }
                Err(e) => {
                    tracing::error!(error = %e, "materialized view job panicked or was cancelled");
                }
            }
        }
    })
}
