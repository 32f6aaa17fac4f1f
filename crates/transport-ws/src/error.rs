use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur in the session transport.
#[derive(Debug, Error)]
pub enum Error {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The listen address.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying stream failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The session was closed, by either side.
    #[error("connection closed")]
    ConnectionClosed,

    /// An outbound envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] vigil_envelope::Error),

    /// The target URL is not a usable websocket URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The listener was closed.
    #[error("listener closed")]
    ListenerClosed,

    /// An inbound frame did not decode as an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] vigil_envelope::Error),

    /// The session has not completed its handshake.
    #[error("session is not active")]
    NotActive,

    /// The peer broke the session protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Whether this error ends only the session it occurred on.
    #[must_use]
    pub const fn is_session_local(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::ConnectionClosed
                | Self::MalformedEnvelope(_)
                | Self::ProtocolViolation(_)
        )
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
