use thiserror::Error;

/// Errors that can occur while decoding or checking envelopes.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A field number of zero, or one too large to represent, was found.
    #[error("invalid field number at offset {offset}")]
    InvalidFieldNumber {
        /// Byte offset of the offending key.
        offset: usize,
    },

    /// The type identifier is not valid UTF-8.
    #[error("type identifier is not valid utf-8")]
    InvalidTypeId,

    /// A length or varint is not representable, or exceeds the configured maximum.
    #[error("malformed length {len} (max {max})")]
    MalformedLength {
        /// The decoded length (saturated when not representable).
        len: u64,
        /// The maximum accepted length.
        max: usize,
    },

    /// An outbound payload exceeds the configured maximum.
    #[error("payload of {len} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// The payload length.
        len: usize,
        /// The maximum accepted length.
        max: usize,
    },

    /// An outbound type identifier exceeds the fixed maximum.
    #[error("type identifier of {len} bytes exceeds maximum of {max} bytes")]
    TypeIdTooLong {
        /// The type identifier length.
        len: usize,
        /// The maximum accepted length.
        max: usize,
    },

    /// The input ended before a complete envelope was read.
    #[error("envelope truncated at offset {offset}")]
    Truncated {
        /// Byte offset at which more input was expected.
        offset: usize,
    },

    /// A known field was encoded with the wrong wire type.
    #[error("field {field} has unexpected wire type {wire_type}")]
    UnexpectedWireType {
        /// The field number.
        field: u32,
        /// The wire type found.
        wire_type: u8,
    },

    /// An unknown field uses a wire type that cannot be skipped.
    #[error("unsupported wire type {wire_type} for field {field}")]
    UnsupportedWireType {
        /// The field number.
        field: u32,
        /// The wire type found.
        wire_type: u8,
    },
}

impl Error {
    /// Whether the error was caused by input that ended too early.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}
