//! lib0-compatible binary primitives.
//!
//! Every integer is a varUint: 7 data bits per byte, least significant
//! group first, high bit set on every byte except the last. Byte arrays
//! and strings carry a varUint length prefix.

use crate::error::{DocSyncError, Result};

/// Longest varUint accepted for a `u64` (10 groups of 7 bits).
const MAX_VAR_UINT_BYTES: usize = 10;

/// Append-only buffer writer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Write a variable-length unsigned integer.
    pub fn write_var_uint(&mut self, mut num: u64) {
        loop {
            let mut byte = (num & 0x7F) as u8;
            num >>= 7;
            if num > 0 {
                byte |= 0x80; // Set continuation bit
            }
            self.buf.push(byte);
            if num == 0 {
                break;
            }
        }
    }

    /// Write a byte array with length prefix.
    pub fn write_var_bytes(&mut self, data: &[u8]) {
        self.write_var_uint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    /// Write a UTF-8 string with byte-length prefix.
    pub fn write_var_string(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received frame.
///
/// Unlike the lenient client-side reader, every read here fails on
/// truncated or oversized input: a malformed frame ends the connection.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Whether unread bytes remain.
    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_var_uint(&mut self) -> Result<u64> {
        let mut num: u64 = 0;
        let mut shift = 0u32;
        for i in 0..MAX_VAR_UINT_BYTES {
            let Some(&byte) = self.data.get(self.pos) else {
                return Err(DocSyncError::Malformed(format!(
                    "truncated varUint at byte {}",
                    self.pos
                )));
            };
            self.pos += 1;

            let group = (byte & 0x7F) as u64;
            if i == MAX_VAR_UINT_BYTES - 1 && group > 1 {
                return Err(DocSyncError::Malformed("varUint overflows u64".into()));
            }
            num |= group << shift;
            if byte & 0x80 == 0 {
                return Ok(num);
            }
            shift += 7;
        }
        Err(DocSyncError::Malformed("varUint overflows u64".into()))
    }

    /// Read a length-prefixed byte array without copying.
    pub fn read_var_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_var_uint()?;
        let len = usize::try_from(len)
            .map_err(|_| DocSyncError::Malformed(format!("byte array length {} too large", len)))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                DocSyncError::Malformed(format!(
                    "byte array of {} bytes exceeds frame ({} remaining)",
                    len,
                    self.data.len() - self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_var_string(&mut self) -> Result<String> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DocSyncError::Malformed(format!("invalid UTF-8 string: {}", e)))
    }
}
