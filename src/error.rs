//! Unified error type.

use thiserror::Error;

/// Boxed error returned by pluggable collaborators (stores, loggers,
/// tracers, metrics backends, hooks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the crate's fallible operations.
///
/// Per-request failures never surface here: handlers and middleware turn
/// them into HTTP [`Response`](crate::Response) values. This type covers
/// construction, configuration and lifecycle failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid service configuration (empty service name,
    /// missing port, out-of-range sample rate).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A collaborator factory failed; `stage` names the step.
    #[error("{stage}: {source}")]
    Construction {
        stage: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("invalid middleware ordering: {0}")]
    OrderingValidation(String),

    #[error("invalid exclusion path: {0}")]
    PathValidation(String),

    #[error("configuring TLS: {0}")]
    Tls(String),

    /// The listener (or a serve hook) stopped with an error.
    #[error("server error: {0}")]
    Serve(#[source] BoxError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// A route could not be registered (conflict or malformed pattern).
    #[error("invalid route `{path}`: {reason}")]
    Route { path: String, reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn construction(stage: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Construction { stage, source: source.into() }
    }
}

/// Failures of the two independent shutdown paths. They are reported
/// separately and never merged.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("server shutdown: {0}")]
    Transport(#[source] BoxError),

    #[error("tracer shutdown: {0}")]
    Tracer(#[source] BoxError),

    /// `shutdown` was called before `start` created a listener.
    #[error("server shutdown: listener not started")]
    NotStarted,
}

/// Returned by [`ServerHandle::shutdown`](crate::ServerHandle::shutdown)
/// when in-flight connections did not drain before the deadline.
#[derive(Debug, Error)]
#[error("deadline exceeded with {in_flight} connection(s) still open")]
pub struct DeadlineExceeded {
    pub in_flight: usize,
}
