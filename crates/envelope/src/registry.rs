use crate::Envelope;

use std::collections::HashMap;
use std::fmt::{self, Debug};

use bytes::Bytes;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type DecodeFn<T> = Box<dyn Fn(Bytes) -> Result<T, BoxError> + Send + Sync>;

/// Errors returned when decoding an envelope through a [`TypeRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The payload could not be decoded by the registered function.
    #[error("failed to decode payload of type {type_id}: {source}")]
    Decode {
        /// The envelope's type identifier.
        type_id: String,
        /// The decoder's error.
        source: BoxError,
    },

    /// No decoder is registered for the type identifier.
    #[error("no decoder registered for type {0}")]
    UnknownType(String),
}

/// Maps envelope type identifiers to payload decoders.
///
/// The codec never consults a registry; callers that understand the payload
/// schemas build one and decode envelopes after they have been framed.
pub struct TypeRegistry<T> {
    decoders: HashMap<String, DecodeFn<T>>,
}

impl<T> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<T> Debug for TypeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T> TypeRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decoder for `type_id`, replacing any previous one.
    #[must_use]
    pub fn with<F, E>(mut self, type_id: impl Into<String>, decode: F) -> Self
    where
        F: Fn(Bytes) -> Result<T, E> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.register(type_id, decode);
        self
    }

    /// Registers a decoder for `type_id`, replacing any previous one.
    pub fn register<F, E>(&mut self, type_id: impl Into<String>, decode: F)
    where
        F: Fn(Bytes) -> Result<T, E> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.decoders.insert(
            type_id.into(),
            Box::new(move |payload: Bytes| decode(payload).map_err(|e| Box::new(e) as BoxError)),
        );
    }

    /// Whether a decoder is registered for `type_id`.
    #[must_use]
    pub fn contains(&self, type_id: &str) -> bool {
        self.decoders.contains_key(type_id)
    }

    /// Decodes the payload of `envelope` with the decoder registered for its type.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownType` if nothing is registered for the
    /// type, or `RegistryError::Decode` if the decoder fails.
    pub fn decode(&self, envelope: &Envelope) -> Result<T, RegistryError> {
        let decode = self
            .decoders
            .get(envelope.type_id())
            .ok_or_else(|| RegistryError::UnknownType(envelope.type_id().to_string()))?;

        decode(envelope.payload().clone()).map_err(|source| RegistryError::Decode {
            type_id: envelope.type_id().to_string(),
            source,
        })
    }
}
