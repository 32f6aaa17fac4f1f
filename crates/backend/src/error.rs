use thiserror::Error;
use vigil_bootable::BootableError;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from running the backend.
#[derive(Debug, Error)]
pub enum Error {
    /// `run` was called on a running backend.
    #[error("already started")]
    AlreadyStarted,

    /// Event bus error.
    #[error(transparent)]
    Bus(#[from] vigil_messaging::Error),

    /// Could not set global default subscriber.
    #[error("could not set global default subscriber: {0}")]
    SetTracing(#[from] tracing::dispatcher::SetGlobalDefaultError),

    /// A subsystem failed to start. Everything started before it has been
    /// shut down again.
    #[error("failed to start {service}: {source}")]
    Start {
        /// The subsystem that failed.
        service: String,
        /// Why it failed.
        #[source]
        source: BootableError,
    },

    /// A subsystem failed to shut down cleanly.
    #[error("failed to stop: {0}")]
    Stop(#[source] BootableError),

    /// Shutdown did not finish before the deadline.
    #[error("shutdown timed out")]
    Timeout,
}
