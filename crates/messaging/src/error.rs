use thiserror::Error;

/// Errors from an event bus.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Could not connect to the bus.
    #[error("failed to connect to bus: {0}")]
    Connect(String),

    /// The topic name is not usable.
    #[error("invalid topic {0:?}: must be non-empty and not contain '.', '*', '>' or whitespace")]
    InvalidTopic(String),

    /// The bus rejected a publish.
    #[error("failed to publish: {0}")]
    Publish(String),

    /// The bus rejected a subscribe.
    #[error("failed to subscribe: {0}")]
    Subscribe(String),
}
