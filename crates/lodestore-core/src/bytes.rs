//! Byte-heap records
//!
//! [`Bytes`] is the canonical dynamic byte container for keys and values;
//! `String` shares its wire format. Both encode as a varint length followed
//! by the raw bytes, with the length capped to protect replay from corrupted
//! size fields.

use std::fmt;
use std::ops::Deref;

use crate::error::{StoreError, StoreResult};
use crate::primitives::{read_varuint, varuint_size, write_varuint};
use crate::serial::Record;

/// Protects replay against corrupted byte-length fields.
pub const MAX_BYTES: usize = 1 << 30;

/// A dynamic byte string usable as a store key or value.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytes(Vec<u8>);

impl Bytes {
    pub fn new() -> Self {
        Bytes(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Bytes(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(v: &[u8]) -> Self {
        Bytes(v.to_vec())
    }
}

impl From<&str> for Bytes {
    fn from(v: &str) -> Self {
        Bytes(v.as_bytes().to_vec())
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Shared write path: varint length + raw bytes.
fn write_byte_heap(dst: &mut [u8], data: &[u8]) -> StoreResult<usize> {
    if data.len() > MAX_BYTES {
        return Err(StoreError::Oversized {
            size: data.len() as u64,
            limit: MAX_BYTES as u64,
            kind: "byte heap",
        });
    }
    let len_size = varuint_size(data.len() as u64);
    let required = len_size + data.len();
    if dst.len() < required {
        return Ok(required);
    }
    write_varuint(dst, data.len() as u64);
    dst[len_size..required].copy_from_slice(data);
    Ok(required)
}

/// Shared read path. `Ok(Some((start, len)))` locates the payload in `src`;
/// `Ok(None)` with the returned requirement means more input is needed.
fn read_byte_heap(src: &[u8]) -> StoreResult<(Option<(usize, usize)>, usize)> {
    let (len, len_size) = read_varuint(src, u64::BITS, u64::MAX)?;
    if len_size > src.len() {
        return Ok((None, len_size));
    }
    if len > MAX_BYTES as u64 {
        return Err(StoreError::Decode {
            reason: format!("byte heap length {} exceeds cap {}", len, MAX_BYTES),
        });
    }
    let required = len_size + len as usize;
    if src.len() < required {
        return Ok((None, required));
    }
    Ok((Some((len_size, len as usize)), required))
}

impl Record for Bytes {
    fn empty() -> Self {
        Bytes::new()
    }

    fn encoded_size(&self) -> usize {
        varuint_size(self.0.len() as u64) + self.0.len()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        write_byte_heap(dst, &self.0)
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        let (span, required) = read_byte_heap(src)?;
        if let Some((start, len)) = span {
            self.0.clear();
            self.0.extend_from_slice(&src[start..start + len]);
        }
        Ok(required)
    }
}

impl Record for String {
    fn empty() -> Self {
        String::new()
    }

    fn encoded_size(&self) -> usize {
        varuint_size(self.len() as u64) + self.len()
    }

    fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        write_byte_heap(dst, self.as_bytes())
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        let (span, required) = read_byte_heap(src)?;
        if let Some((start, len)) = span {
            let text = std::str::from_utf8(&src[start..start + len]).map_err(|e| {
                StoreError::Decode {
                    reason: format!("string payload is not valid UTF-8: {}", e),
                }
            })?;
            self.clear();
            self.push_str(text);
        }
        Ok(required)
    }
}
