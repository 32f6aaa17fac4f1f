use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Errors that prevent a cluster member from starting.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A listen address could not be bound.
    #[error("failed to bind {url}: {source}")]
    Bind {
        /// The listen URL.
        url: Url,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Persisted state could not be decoded.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// The configuration is invalid.
    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),

    /// No leader was elected before the startup timeout.
    #[error("no quorum reached within {0:?}")]
    QuorumTimeout(Duration),

    /// The raft node could not be created or initialized.
    #[error("raft error: {0}")]
    Raft(String),

    /// The state directory could not be created or opened.
    #[error("state directory {path:?} is unusable: {source}")]
    StateDir {
        /// The directory.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another live instance owns the state directory.
    #[error("state directory {0:?} is locked by another instance")]
    StateDirLocked(PathBuf),

    /// The on-disk database could not be opened.
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),
}

/// Errors from the cluster store and its clients.
#[derive(Debug, Error)]
pub enum Error {
    /// The store is already running.
    #[error("already started")]
    AlreadyStarted,

    /// The member API rejected a request.
    #[error("request failed with status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message returned by the member.
        message: String,
    },

    /// Bootstrap failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// Could not reach the member.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// A response could not be decoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The store is not running.
    #[error("not started")]
    NotStarted,

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The cluster cannot serve the request right now (no leader, lost quorum).
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The watch stream failed.
    #[error("watch failed: {0}")]
    Watch(String),
}

impl Error {
    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout | Self::Http(_))
    }

    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(error)
        }
    }
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
