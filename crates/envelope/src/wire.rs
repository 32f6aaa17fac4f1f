use crate::Error;

use std::ops::Range;

/// Maximum encoded size of a 64-bit varint.
const MAX_VARINT_LEN: usize = 10;

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LENGTH_DELIMITED: u8 = 2;
pub const WIRE_FIXED32: u8 = 5;

/// Cursor over an encoded envelope. Every read is bounds-checked and reports
/// running out of input as `Truncated`.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    max_len: usize,
}

impl<'a> Reader<'a> {
    pub const fn new(buf: &'a [u8], max_len: usize) -> Self {
        Self {
            buf,
            pos: 0,
            max_len,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn read_varint(&mut self) -> Result<u64, Error> {
        let mut value = 0u64;

        for index in 0..MAX_VARINT_LEN {
            let Some(&byte) = self.buf.get(self.pos) else {
                return Err(Error::Truncated { offset: self.pos });
            };
            self.pos += 1;

            // The tenth byte may only carry the single remaining bit.
            if index == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(self.malformed(u64::MAX));
            }

            value |= u64::from(byte & 0x7f) << (7 * index);

            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }

        Err(self.malformed(u64::MAX))
    }

    /// Reads a length prefix followed by that many bytes, returning the range
    /// of the body within the input.
    pub fn read_length_delimited(&mut self) -> Result<Range<usize>, Error> {
        self.read_bounded(self.max_len)
    }

    /// Like [`Self::read_length_delimited`], with a field-specific limit.
    pub fn read_bounded(&mut self, max_len: usize) -> Result<Range<usize>, Error> {
        let malformed = |len| Error::MalformedLength { len, max: max_len };

        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| malformed(len))?;

        if len > max_len {
            return Err(malformed(len as u64));
        }

        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| malformed(len as u64))?;

        if end > self.buf.len() {
            return Err(Error::Truncated {
                offset: self.buf.len(),
            });
        }

        let range = self.pos..end;
        self.pos = end;
        Ok(range)
    }

    fn advance(&mut self, len: usize) -> Result<(), Error> {
        if self.buf.len() - self.pos < len {
            return Err(Error::Truncated {
                offset: self.buf.len(),
            });
        }
        self.pos += len;
        Ok(())
    }

    /// Skips over the body of an unknown field.
    pub fn skip_field(&mut self, field: u32, wire_type: u8) -> Result<(), Error> {
        match wire_type {
            WIRE_VARINT => self.read_varint().map(|_| ()),
            WIRE_FIXED64 => self.advance(8),
            WIRE_LENGTH_DELIMITED => self.read_length_delimited().map(|_| ()),
            WIRE_FIXED32 => self.advance(4),
            _ => Err(Error::UnsupportedWireType { field, wire_type }),
        }
    }

    const fn malformed(&self, len: u64) -> Error {
        Error::MalformedLength {
            len,
            max: self.max_len,
        }
    }
}
