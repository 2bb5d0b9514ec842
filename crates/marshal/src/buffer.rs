use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Growable output buffer used by the marshaller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemBuffer(BytesMut);

impl MemBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self(BytesMut::with_capacity(capacity))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push_u8(&mut self, v: u8) {
        self.0.put_u8(v);
    }

    pub fn push_i32_le(&mut self, v: i32) {
        self.0.put_i32_le(v);
    }

    pub fn push_u32_le(&mut self, v: u32) {
        self.0.put_u32_le(v);
    }

    pub fn push_i64_le(&mut self, v: i64) {
        self.0.put_i64_le(v);
    }

    pub fn push_f64_le(&mut self, v: f64) {
        self.0.put_f64_le(v);
    }

    pub fn push_slice(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }

    /// Append a zeroed `u32` slot and return its offset for [`Self::patch_u32_le`].
    pub fn reserve_u32(&mut self) -> usize {
        let offset = self.0.len();
        self.0.put_u32_le(0);
        offset
    }

    /// Overwrite four bytes at `offset` with `v` in little-endian order.
    ///
    /// # Panics
    /// Panics if `offset + 4` is past the end of the buffer.
    pub fn patch_u32_le(&mut self, offset: usize, v: u32) {
        self.0[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.0.freeze()
    }

    /// # Errors
    /// Returns an error if the contents are not valid UTF-8.
    pub fn to_utf8_string(&self) -> Result<String> {
        bytes_to_string(&self.0)
    }

    #[must_use]
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<&str> for MemBuffer {
    fn from(value: &str) -> Self {
        Self(BytesMut::from(value.as_bytes()))
    }
}

impl From<String> for MemBuffer {
    fn from(value: String) -> Self {
        Self(BytesMut::from(value.as_bytes()))
    }
}

impl From<Vec<u8>> for MemBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self(BytesMut::from(&value[..]))
    }
}

impl AsRef<[u8]> for MemBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[must_use]
pub fn string_to_bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// # Errors
/// Returns an error if `b` is not valid UTF-8.
pub fn bytes_to_string(b: &[u8]) -> Result<String> {
    String::from_utf8(b.to_vec()).map_err(Error::from)
}
