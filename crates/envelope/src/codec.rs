use crate::wire::{Reader, WIRE_LENGTH_DELIMITED};
use crate::{Envelope, Error, PAYLOAD_FIELD, TYPE_ID_FIELD};

use std::ops::Range;

use bytes::Bytes;

/// Default maximum payload size (10 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Maximum length of a type identifier, independent of the payload limit.
pub const MAX_TYPE_ID_LEN: usize = 32 * 1024;

// Two one-byte keys plus two varint lengths of at most ten bytes each.
const MAX_HEADER_LEN: usize = 2 * (1 + 10);

/// Size-limited envelope decoder.
///
/// The limit applies to every length prefix on the wire except the type
/// identifier, which is bounded by [`MAX_TYPE_ID_LEN`]. A hostile peer can
/// never make the decoder allocate more than [`Self::max_encoded_len`] bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvelopeCodec {
    max_payload_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl EnvelopeCodec {
    /// Creates a codec accepting payloads up to `max_payload_size` bytes.
    #[must_use]
    pub const fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// The configured maximum payload size.
    #[must_use]
    pub const fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Upper bound on the encoded size of any envelope this codec accepts.
    #[must_use]
    pub const fn max_encoded_len(&self) -> usize {
        self.max_payload_size
            .saturating_add(MAX_TYPE_ID_LEN)
            .saturating_add(MAX_HEADER_LEN)
    }

    /// Checks that an outbound envelope fits within the configured limits.
    ///
    /// # Errors
    ///
    /// Returns `Error::TypeIdTooLong` if the type identifier exceeds
    /// [`MAX_TYPE_ID_LEN`], `Error::PayloadTooLarge` if the payload exceeds
    /// the configured maximum.
    pub fn check(&self, envelope: &Envelope) -> Result<(), Error> {
        if envelope.type_id.len() > MAX_TYPE_ID_LEN {
            return Err(Error::TypeIdTooLong {
                len: envelope.type_id.len(),
                max: MAX_TYPE_ID_LEN,
            });
        }

        if envelope.payload.len() > self.max_payload_size {
            return Err(Error::PayloadTooLarge {
                len: envelope.payload.len(),
                max: self.max_payload_size,
            });
        }

        Ok(())
    }

    /// Encodes an envelope after checking it against the configured limit.
    ///
    /// # Errors
    ///
    /// Returns `Error::PayloadTooLarge` if the envelope would be rejected by a
    /// peer using the same limit.
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, Error> {
        self.check(envelope)?;
        Ok(envelope.encode())
    }

    /// Decodes an envelope from a byte slice, copying the fields out.
    ///
    /// # Errors
    ///
    /// See [`Error`] for the possible decode failures.
    pub fn decode(&self, buf: &[u8]) -> Result<Envelope, Error> {
        let (type_id, payload) = self.parse(buf)?;

        Ok(Envelope {
            type_id: type_id_from_utf8(&buf[type_id])?,
            payload: Bytes::copy_from_slice(&buf[payload]),
        })
    }

    /// Decodes an envelope from shared bytes; the payload is a zero-copy slice
    /// of `buf`.
    ///
    /// # Errors
    ///
    /// See [`Error`] for the possible decode failures.
    pub fn decode_bytes(&self, buf: &Bytes) -> Result<Envelope, Error> {
        let (type_id, payload) = self.parse(buf)?;

        Ok(Envelope {
            type_id: type_id_from_utf8(&buf[type_id])?,
            payload: buf.slice(payload),
        })
    }

    fn parse(&self, buf: &[u8]) -> Result<(Range<usize>, Range<usize>), Error> {
        let mut reader = Reader::new(buf, self.max_payload_size);
        let mut type_id = None;
        let mut payload = None;

        while !reader.is_empty() {
            let offset = reader.position();
            let key = reader.read_varint()?;

            let field = u32::try_from(key >> 3)
                .ok()
                .filter(|field| *field != 0)
                .ok_or(Error::InvalidFieldNumber { offset })?;
            #[allow(clippy::cast_possible_truncation)]
            let wire_type = (key & 0x07) as u8;

            match (field, wire_type) {
                (TYPE_ID_FIELD, WIRE_LENGTH_DELIMITED) => {
                    type_id = Some(reader.read_bounded(MAX_TYPE_ID_LEN)?);
                }
                (PAYLOAD_FIELD, WIRE_LENGTH_DELIMITED) => {
                    payload = Some(reader.read_length_delimited()?);
                }
                (TYPE_ID_FIELD | PAYLOAD_FIELD, _) => {
                    return Err(Error::UnexpectedWireType { field, wire_type });
                }
                _ => reader.skip_field(field, wire_type)?,
            }
        }

        // Both fields are always written, so a missing one means the input
        // was cut short at a field boundary.
        match (type_id, payload) {
            (Some(type_id), Some(payload)) => Ok((type_id, payload)),
            _ => Err(Error::Truncated { offset: buf.len() }),
        }
    }
}

fn type_id_from_utf8(bytes: &[u8]) -> Result<String, Error> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| Error::InvalidTypeId)
}
