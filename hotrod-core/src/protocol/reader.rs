//! Resumable reader over a partially received frame.

use bytes::Bytes;

use super::constants::{MAX_VINT_BYTES, MAX_VLONG_BYTES};
use crate::error::HotRodError;

/// Why a read over the buffered bytes stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed; the caller should read from the socket and retry.
    Incomplete,
    /// The stream is out of sync and the connection must be dropped.
    Desync(String),
    /// The frame was read fully but its contents are invalid.
    Malformed(String),
}

impl From<DecodeError> for HotRodError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Incomplete => HotRodError::Protocol("truncated frame".to_string()),
            DecodeError::Desync(m) => HotRodError::ProtocolDesync(m),
            DecodeError::Malformed(m) => HotRodError::Protocol(m),
        }
    }
}

/// Result alias for reads that may need more bytes.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// A cursor over buffered bytes that never consumes from the source.
///
/// Decoding restarts from the frame start whenever it hits
/// [`DecodeError::Incomplete`], so the reader only tracks a position and the
/// caller advances the real buffer once a whole frame has been parsed.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of bytes left in the buffer.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(DecodeError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian unsigned short.
    pub fn read_u16(&mut self) -> DecodeResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian signed long.
    pub fn read_i64(&mut self) -> DecodeResult<i64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    /// Reads an unsigned 32-bit VInt.
    pub fn read_vint(&mut self) -> DecodeResult<u32> {
        let value = self.read_varint(MAX_VINT_BYTES)?;
        u32::try_from(value)
            .map_err(|_| DecodeError::Desync(format!("VInt overflows 32 bits: {}", value)))
    }

    /// Reads an unsigned 64-bit VLong.
    pub fn read_vlong(&mut self) -> DecodeResult<u64> {
        self.read_varint(MAX_VLONG_BYTES)
    }

    fn read_varint(&mut self, max_bytes: usize) -> DecodeResult<u64> {
        let mut result: u64 = 0;
        for i in 0..max_bytes {
            let b = self.read_u8()?;
            result |= u64::from(b & 0x7F) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DecodeError::Desync(format!(
            "variable-length integer exceeds {} bytes",
            max_bytes
        )))
    }

    /// Reads a VInt length prefix and returns the raw slice it covers.
    pub fn read_slice(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.read_vint()? as usize;
        self.take(len)
    }

    /// Reads a length-prefixed byte array into an owned buffer.
    pub fn read_array(&mut self) -> DecodeResult<Bytes> {
        Ok(Bytes::copy_from_slice(self.read_slice()?))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> DecodeResult<String> {
        let raw = self.read_slice()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| DecodeError::Malformed(format!("invalid UTF-8 string: {}", e)))
    }

    /// Reads an array whose absence is encoded as signed length `-1`.
    pub fn read_optional_array(&mut self) -> DecodeResult<Option<Bytes>> {
        let len = super::vint::zigzag_decode(self.read_vint()?);
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(self.take(len as usize)?)))
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: usize) -> DecodeResult<()> {
        self.take(len).map(|_| ())
    }
}
