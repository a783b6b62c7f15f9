//! Error reporting for the Lunary API backend.
//!
//! Request-handling failures (panics and 5xx responses) are captured by the
//! server's outermost middleware and handed to an [`ErrorReporter`]. The
//! reporter either logs them or forwards them to an external collector.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lunary_observe::{reporter_from_url, ErrorEvent, ErrorKind};
//!
//! let reporter = reporter_from_url(config.observe.collector_url.as_deref())?;
//! reporter.report(ErrorEvent::new(ErrorKind::Panic, "GET", "/v1/runs", 500, "boom"));
//! ```

mod error;
mod event;
mod reporter;

pub use error::ObserveError;
pub use event::{ErrorEvent, ErrorKind};
pub use reporter::{reporter_from_url, CollectorReporter, ErrorReporter, TracingReporter};
