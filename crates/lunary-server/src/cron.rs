//! Recurring maintenance jobs.
//!
//! Each registered job runs in its own task, sleeping until its next
//! scheduled time and doing its SQLite work on the blocking pool. Every job
//! stops when the shutdown broadcast fires, so none is left running against a
//! closed database.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lunary_db::{
    prune_webhook_events, reset_daily_event_counts, update_limited_orgs, Database, DbError,
};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Webhook events older than this are pruned.
const WEBHOOK_RETENTION_DAYS: u32 = 30;

/// When a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period, first run one period after registration.
    Every(Duration),
    /// Once a day at `hour:minute` UTC.
    DailyAt { hour: u32, minute: u32 },
}

impl Schedule {
    /// Time to wait from `now` until the next run.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match *self {
            Schedule::Every(period) => period,
            Schedule::DailyAt { hour, minute } => {
                let Some(today) = now.date_naive().and_hms_opt(hour, minute, 0) else {
                    tracing::warn!(hour, minute, "invalid daily schedule, running in 24h");
                    return Duration::from_secs(24 * 60 * 60);
                };
                let mut next = today.and_utc();
                if next <= now {
                    next += ChronoDuration::days(1);
                }
                (next - now).to_std().unwrap_or_default()
            }
        }
    }
}

/// A named maintenance job.
#[derive(Clone, Copy)]
pub struct CronJob {
    pub name: &'static str,
    pub schedule: Schedule,
    /// Returns the number of rows affected.
    pub run: fn(&Connection) -> Result<usize, DbError>,
}

fn prune_old_webhook_events(conn: &Connection) -> Result<usize, DbError> {
    prune_webhook_events(conn, WEBHOOK_RETENTION_DAYS)
}

/// Jobs registered at startup.
pub const CRON_JOBS: &[CronJob] = &[
    CronJob {
        name: "reset-daily-usage",
        schedule: Schedule::DailyAt { hour: 0, minute: 0 },
        run: reset_daily_event_counts,
    },
    CronJob {
        name: "update-limited-orgs",
        schedule: Schedule::Every(Duration::from_secs(10 * 60)),
        run: update_limited_orgs,
    },
    CronJob {
        name: "prune-webhook-events",
        schedule: Schedule::Every(Duration::from_secs(60 * 60)),
        run: prune_old_webhook_events,
    },
];

/// Owns the tasks of registered jobs.
#[derive(Debug)]
pub struct JobScheduler {
    db: Database,
    shutdown: broadcast::Sender<()>,
    jobs: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(db: Database, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            db,
            shutdown,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns `job` unless a job with the same name is already registered.
    ///
    /// Returns `true` if the job was spawned. Never blocks; must be called
    /// from within a Tokio runtime.
    pub fn register(&self, job: CronJob) -> bool {
        let mut jobs = self.lock_jobs();
        if jobs.contains_key(job.name) {
            tracing::debug!(job = job.name, "cron job already registered");
            return false;
        }
        let handle = tokio::spawn(run_job(self.db.clone(), job, self.shutdown.subscribe()));
        jobs.insert(job.name, handle);
        tracing::info!(job = job.name, schedule = ?job.schedule, "registered cron job");
        true
    }

    /// Names of registered jobs, sorted.
    pub fn registered(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.lock_jobs().keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Signals every job to stop and waits up to `timeout` for them, aborting
    /// stragglers.
    pub async fn stop(&self, timeout: Duration) {
        let _ = self.shutdown.send(());
        let jobs = std::mem::take(&mut *self.lock_jobs());
        let deadline = tokio::time::Instant::now() + timeout;

        for (name, mut handle) in jobs {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!(job = name, "cron job did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<&'static str, JoinHandle<()>>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::error!("cron registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Registers every job in [`CRON_JOBS`]. Safe to call more than once.
pub fn setup_cron_jobs(scheduler: &JobScheduler) -> usize {
    CRON_JOBS
        .iter()
        .filter(|job| scheduler.register(**job))
        .count()
}

async fn run_job(db: Database, job: CronJob, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let delay = job.schedule.next_delay(Utc::now());
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                tracing::debug!(job = job.name, "cron job received shutdown signal");
                break;
            }
        }

        let db = db.clone();
        let run = job.run;
        let result = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            run(&conn)
        })
        .await;

        match result {
            Ok(Ok(affected)) => {
                if affected > 0 {
                    tracing::info!(job = job.name, affected, "cron job completed");
                } else {
                    tracing::debug!(job = job.name, "cron job completed, nothing to do");
                }
            }
            Ok(Err(DbError::Closed)) => {
                tracing::debug!(job = job.name, "database closed, stopping cron job");
                break;
            }
            Ok(Err(e)) => {
                tracing::error!(job = job.name, error = %e, "cron job failed");
            }
            Err(e) => {
                tracing::error!(job = job.name, error = %e, "cron job panicked or was cancelled");
            }
        }
    }
}
