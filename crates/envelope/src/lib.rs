//! Self-describing message envelopes and their length-delimited wire format.
//!
//! An [`Envelope`] pairs a namespaced type identifier with an opaque payload.
//! The encoding is protobuf compatible: field 1 carries the type identifier,
//! field 2 the payload, each prefixed by a LEB128 varint length.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod error;
mod registry;
mod wire;

pub use codec::{DEFAULT_MAX_PAYLOAD_SIZE, EnvelopeCodec, MAX_TYPE_ID_LEN};
pub use error::Error;
pub use registry::{RegistryError, TypeRegistry};

use bytes::{BufMut, Bytes, BytesMut};
use prost::encoding::{WireType, encode_key, encode_varint, encoded_len_varint, key_len};

/// Type identifier for an untyped envelope.
pub const ANY_TYPE: &str = "vigil.types.Any";

/// Type identifier of the handshake sent by a connecting agent.
pub const AGENT_HANDSHAKE_TYPE: &str = "vigil.types.AgentHandshake";

/// Type identifier of the handshake answered by the backend.
pub const BACKEND_HANDSHAKE_TYPE: &str = "vigil.types.BackendHandshake";

const TYPE_ID_FIELD: u32 = 1;
const PAYLOAD_FIELD: u32 = 2;

/// A type identifier plus opaque payload bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Envelope {
    type_id: String,
    payload: Bytes,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(type_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id: type_id.into(),
            payload: payload.into(),
        }
    }

    /// The type identifier naming the schema of the payload.
    #[must_use]
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// The payload bytes.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Splits the envelope into its type identifier and payload.
    #[must_use]
    pub fn into_parts(self) -> (String, Bytes) {
        (self.type_id, self.payload)
    }

    /// Number of bytes produced by [`Envelope::encode`].
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let type_id_len = self.type_id.len();
        let payload_len = self.payload.len();

        key_len(TYPE_ID_FIELD)
            + encoded_len_varint(type_id_len as u64)
            + type_id_len
            + key_len(PAYLOAD_FIELD)
            + encoded_len_varint(payload_len as u64)
            + payload_len
    }

    /// Writes the encoded envelope into `buf`.
    ///
    /// Both fields are always written, even when empty.
    pub fn encode_to(&self, buf: &mut impl BufMut) {
        encode_key(TYPE_ID_FIELD, WireType::LengthDelimited, buf);
        encode_varint(self.type_id.len() as u64, buf);
        buf.put_slice(self.type_id.as_bytes());

        encode_key(PAYLOAD_FIELD, WireType::LengthDelimited, buf);
        encode_varint(self.payload.len() as u64, buf);
        buf.put_slice(&self.payload);
    }

    /// Encodes the envelope.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Decodes an envelope using the default size limit.
    ///
    /// # Errors
    ///
    /// See [`Error`] for the possible decode failures.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        EnvelopeCodec::default().decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let envelope = Envelope::new("a", "bc");
        assert_eq!(
            envelope.encode().as_ref(),
            &[0x0a, 0x01, b'a', 0x12, 0x02, b'b', b'c']
        );
    }

    #[test]
    fn test_empty_fields_are_written() {
        let envelope = Envelope::default();
        assert_eq!(envelope.encode().as_ref(), &[0x0a, 0x00, 0x12, 0x00]);
        assert_eq!(Envelope::decode(&envelope.encode()), Ok(envelope));
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        let envelope = Envelope::new(ANY_TYPE, vec![7u8; 300]);
        assert_eq!(envelope.encoded_len(), envelope.encode().len());
    }

    #[test]
    fn test_empty_input_is_truncated() {
        assert_eq!(Envelope::decode(&[]), Err(Error::Truncated { offset: 0 }));
    }

    #[test]
    fn test_missing_payload_is_truncated() {
        assert_eq!(
            Envelope::decode(&[0x0a, 0x01, b'a']),
            Err(Error::Truncated { offset: 3 })
        );
    }
}
