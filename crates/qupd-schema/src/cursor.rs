//! Bounds-checked reader over a byte slice.
//!
//! Every read names the field it is reading so that a short buffer produces
//! an error pointing at the exact field that ran off the end.

use crate::package::PackageError;

/// A forward-only cursor over borrowed bytes.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Start reading at offset zero.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Everything read so far.
    pub fn consumed(&self) -> &'a [u8] {
        &self.bytes[..self.pos]
    }

    /// Read exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::Truncated`] if fewer than `len` bytes remain.
    pub fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], PackageError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(PackageError::Truncated {
                field,
                needed: len,
                remaining,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read a fixed-size array.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::Truncated`] if fewer than `N` bytes remain.
    pub fn take_array<const N: usize>(
        &mut self,
        field: &'static str,
    ) -> Result<[u8; N], PackageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    /// Read a single byte.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::Truncated`] at end of input.
    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, PackageError> {
        Ok(self.take_array::<1>(field)?[0])
    }

    /// Read a big-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::Truncated`] if fewer than two bytes remain.
    pub fn read_u16_be(&mut self, field: &'static str) -> Result<u16, PackageError> {
        Ok(u16::from_be_bytes(self.take_array(field)?))
    }

    /// Read a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::Truncated`] if fewer than four bytes remain.
    pub fn read_u32_be(&mut self, field: &'static str) -> Result<u32, PackageError> {
        Ok(u32::from_be_bytes(self.take_array(field)?))
    }

    /// Read a `u8` length prefix followed by that many bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::Truncated`] if the prefix or body is short.
    pub fn read_prefixed_u8(&mut self, field: &'static str) -> Result<&'a [u8], PackageError> {
        let len = self.read_u8(field)?;
        self.take(usize::from(len), field)
    }

    /// Read a big-endian `u16` length prefix followed by that many bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::Truncated`] if the prefix or body is short.
    pub fn read_prefixed_u16(&mut self, field: &'static str) -> Result<&'a [u8], PackageError> {
        let len = self.read_u16_be(field)?;
        self.take(usize::from(len), field)
    }

    /// Read a big-endian `u32` length prefix followed by that many bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::Truncated`] if the prefix or body is short.
    pub fn read_prefixed_u32(&mut self, field: &'static str) -> Result<&'a [u8], PackageError> {
        let len = self.read_u32_be(field)?;
        self.take(len as usize, field)
    }
}
