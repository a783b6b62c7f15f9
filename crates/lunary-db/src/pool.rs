//! Connection pool creation, liveness checks and bounded shutdown drain.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::DbError;

/// How often `Database::close` re-checks the pool while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// How long a checkout may wait for a connection, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            connect_timeout_ms: 5_000,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// A connection checked out of the pool.
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Creates a new SQLite connection pool with WAL mode and foreign keys enabled.
///
/// The pool is built lazily: connectivity is not verified here. Call
/// [`Database::check_connection`] before serving traffic.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. Use `:memory:` for an
///   in-memory database (each pooled connection then gets its own database).
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> DbPool {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // In-memory databases report "memory", which is expected.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))
        });

    Pool::builder()
        .max_size(settings.pool_max_size)
        .connection_timeout(Duration::from_millis(settings.connect_timeout_ms))
        .build_unchecked(manager)
}

/// Result of draining the pool at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every checked-out connection was returned before the deadline.
    Drained,
    /// The deadline passed; `abandoned` connections were still checked out.
    TimedOut {
        /// Connections still in use when the deadline passed.
        abandoned: u32,
    },
    /// `close` had already been called.
    AlreadyClosed,
}

/// Shared database handle.
///
/// Cloning is cheap; all clones observe the same open/closed state.
#[derive(Clone, Debug)]
pub struct Database {
    pool: Arc<RwLock<Option<DbPool>>>,
}

impl Database {
    /// Wraps an existing pool.
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool: Arc::new(RwLock::new(Some(pool))),
        }
    }

    /// Opens a pool at `db_path` and wraps it.
    pub fn open(db_path: &str, settings: DbRuntimeSettings) -> Self {
        Self::new(create_pool(db_path, settings))
    }

    /// Checks out a connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] after [`Database::close`], or
    /// [`DbError::Pool`] if no connection becomes available in time.
    pub fn get(&self) -> Result<DbConnection, DbError> {
        let pool = self.read_slot().clone().ok_or(DbError::Closed)?;
        Ok(pool.get()?)
    }

    /// Verifies the database is reachable by running `SELECT 1`.
    pub fn check_connection(&self) -> Result<(), DbError> {
        let conn = self.get()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        tracing::debug!("database connection verified");
        Ok(())
    }

    /// Returns `true` once [`Database::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.read_slot().is_none()
    }

    /// Number of connections currently checked out of the pool.
    pub fn in_use(&self) -> u32 {
        self.read_slot()
            .as_ref()
            .map(|pool| {
                let state = pool.state();
                state.connections - state.idle_connections
            })
            .unwrap_or(0)
    }

    /// Closes the pool, waiting at most `timeout` for checked-out connections
    /// to be returned.
    ///
    /// New checkouts fail immediately once this is called. Connections still
    /// in use at the deadline are abandoned: they are closed whenever their
    /// holder drops them. This call blocks the current thread.
    pub fn close(&self, timeout: Duration) -> DrainOutcome {
        let Some(pool) = self.write_slot().take() else {
            return DrainOutcome::AlreadyClosed;
        };

        let deadline = Instant::now() + timeout;
        loop {
            let state = pool.state();
            let in_use = state.connections - state.idle_connections;
            if in_use == 0 {
                tracing::info!("database pool drained");
                return DrainOutcome::Drained;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    abandoned = in_use,
                    timeout_ms = timeout.as_millis() as u64,
                    "database drain timed out, abandoning in-flight connections"
                );
                return DrainOutcome::TimedOut { abandoned: in_use };
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Option<DbPool>> {
        self.pool.read().unwrap_or_else(|poisoned| {
            tracing::error!("database handle lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<DbPool>> {
        self.pool.write().unwrap_or_else(|poisoned| {
            tracing::error!("database handle lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
