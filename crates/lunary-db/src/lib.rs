//! Database layer for the Lunary API backend.
//!
//! Provides SQLite connection pooling (via `r2d2`), a [`Database`] handle that
//! can be liveness-checked at boot and drained at shutdown, embedded SQL
//! migrations, the materialized-view refresh routine, and the query helpers
//! used by the route groups and scheduled jobs.
//!
//! # Design decisions
//!
//! - **`r2d2` connection pool**: bounded connection reuse; checkout and return
//!   discipline is owned entirely by the pool.
//! - **Explicit close**: the pool is taken out of the [`Database`] handle on
//!   close, so later checkouts fail with [`DbError::Closed`] instead of
//!   silently reopening connections.
//! - **Materialized views as summary tables**: SQLite has no native
//!   materialized views, so each view is a plain table rebuilt wholesale
//!   inside a transaction.

mod error;
mod keys;
mod migrations;
mod pool;
mod runs;
mod usage;
mod views;
mod webhooks;

pub use error::DbError;
pub use keys::{find_api_key, ApiKeyRecord, KeyKind};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, Database, DbConnection, DbPool, DbRuntimeSettings, DrainOutcome};
pub use runs::{insert_runs, list_projects, NewRun, Project};
pub use usage::{
    daily_usage, org_is_limited, reset_daily_event_counts, update_limited_orgs, DailyUsage,
};
pub use views::{refresh_materialized_views, MaterializedView, ViewRefresh, MATERIALIZED_VIEWS};
pub use webhooks::{prune_webhook_events, record_webhook_event};
