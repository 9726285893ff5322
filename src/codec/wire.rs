//! Wire Primitives
//!
//! Cursor-based reader/writer for the binary wire format. All integers are
//! fixed-width big-endian; byte arrays are length-prefixed with an `i32`.
//! A read that would run past the end of the buffer fails with
//! [`CodecError::UnexpectedEof`] - it never silently truncates.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A read ran past the end of the buffer.
    #[error("unexpected end of message: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A declared length was negative or larger than the remaining bytes.
    #[error("declared length {declared} out of range ({remaining} bytes remaining)")]
    LengthOutOfRange {
        /// Length field as decoded.
        declared: i64,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A declared element count was negative or implausible for the
    /// remaining bytes.
    #[error("declared count {declared} out of range ({remaining} bytes remaining)")]
    CountOutOfRange {
        /// Count field as decoded.
        declared: i64,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// The message type tag is not a known message.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Decoding finished with unconsumed bytes.
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    /// The message body was empty where a tag byte was required.
    #[error("empty message")]
    EmptyMessage,
}

/// Growable buffer writer advancing a cursor over big-endian fields.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Append a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Append a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append an `i32` length prefix followed by the raw bytes.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_i32(value.len() as i32);
        self.buf.extend_from_slice(value);
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Borrowing reader advancing a cursor over big-endian fields.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Create a reader over a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True if every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a big-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(arr))
    }

    /// Read an `i32` length prefix followed by that many raw bytes.
    ///
    /// The length is validated against the remaining buffer before any
    /// allocation happens.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let declared = self.read_i32()?;
        if declared < 0 || declared as usize > self.remaining() {
            return Err(CodecError::LengthOutOfRange {
                declared: declared as i64,
                remaining: self.remaining(),
            });
        }
        Ok(self.take(declared as usize)?.to_vec())
    }

    /// Read an `i32` element count, validated to be non-negative and
    /// plausible for the remaining bytes given a minimum element size.
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize, CodecError> {
        let declared = self.read_i32()?;
        let remaining = self.remaining();
        if declared < 0 || (declared as usize).saturating_mul(min_element_size.max(1)) > remaining {
            return Err(CodecError::CountOutOfRange {
                declared: declared as i64,
                remaining,
            });
        }
        Ok(declared as usize)
    }

    /// Fail with [`CodecError::TrailingBytes`] if any bytes remain.
    pub fn expect_end(&self) -> Result<(), CodecError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(self.remaining()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_roundtrip() {
        let mut w = WireWriter::new();
        w.write_u8(0xAB);
        w.write_i32(-1);
        w.write_i32(i32::MAX);
        w.write_u32(0xDEAD_BEEF);
        w.write_i64(i64::MIN);

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_i32().unwrap(), -1);
        assert_eq!(r.read_i32().unwrap(), i32::MAX);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert!(r.is_empty());
    }

    #[test]
    fn test_bytes_roundtrip_empty() {
        let mut w = WireWriter::new();
        w.write_bytes(&[]);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 4);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_bytes().unwrap(), Vec::<u8>::new());
        r.expect_end().unwrap();
    }

    #[test]
    fn test_bytes_roundtrip() {
        let payload = vec![1u8, 2, 3, 4, 5];
        let mut w = WireWriter::new();
        w.write_bytes(&payload);

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_bytes().unwrap(), payload);
    }

    #[test]
    fn test_read_past_end() {
        let mut r = WireReader::new(&[0x01, 0x02]);
        let err = r.read_i32().unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedEof {
                needed: 4,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut w = WireWriter::new();
        w.write_i32(-5);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            r.read_bytes(),
            Err(CodecError::LengthOutOfRange { declared: -5, .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut w = WireWriter::new();
        w.write_i32(1_000_000);
        w.write_u8(0);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            r.read_bytes(),
            Err(CodecError::LengthOutOfRange { .. })
        ));
    }

    #[test]
    fn test_count_validation() {
        let mut w = WireWriter::new();
        w.write_i32(500);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            r.read_count(4),
            Err(CodecError::CountOutOfRange { declared: 500, .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let mut w = WireWriter::new();
        w.write_u8(1);
        w.write_u8(2);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        r.read_u8().unwrap();
        assert_eq!(r.expect_end(), Err(CodecError::TrailingBytes(1)));
    }
}
