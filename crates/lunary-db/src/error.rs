use thiserror::Error;

/// Errors raised by the database handle and query helpers.
#[derive(Debug, Error)]
pub enum DbError {
    /// The pool was closed during shutdown; no further checkouts are served.
    #[error("database is closed")]
    Closed,

    /// The pool could not hand out a connection in time.
    #[error("failed to check out a database connection: {0}")]
    Pool(#[from] r2d2::Error),

    /// A SQL statement failed.
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}
