#![forbid(unsafe_code)]
//! Big-endian encoders used by the record wire format and page layouts.

use crate::types::{Lsn, Result, StorageError};

/// Appends fixed-width and length-prefixed fields to a byte vector.
pub struct ByteWriter<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> ByteWriter<'a> {
    /// Wraps an output vector; bytes are appended after its current end.
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    /// Writes one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    /// Writes a bool as one byte.
    pub fn put_bool(&mut self, v: bool) {
        self.out.push(u8::from(v));
    }

    /// Writes a big-endian `u16`.
    pub fn put_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian `i32`.
    pub fn put_i32(&mut self, v: i32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian `u64`.
    pub fn put_u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian `i64`.
    pub fn put_i64(&mut self, v: i64) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes an LSN as segment then position.
    pub fn put_lsn(&mut self, lsn: Lsn) {
        self.out.extend_from_slice(&lsn.to_be_bytes());
    }

    /// Writes a `u32` length prefix followed by the bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.out.extend_from_slice(bytes);
    }

    /// Writes a count followed by each length-prefixed item.
    pub fn put_byte_list(&mut self, items: &[Vec<u8>]) {
        self.put_u32(items.len() as u32);
        for item in items {
            self.put_bytes(item);
        }
    }
}

/// Encoded size of a length-prefixed byte field.
pub const fn bytes_len(len: usize) -> usize {
    4 + len
}

/// Encoded size of a list written by [`ByteWriter::put_byte_list`].
pub fn byte_list_len(items: &[Vec<u8>]) -> usize {
    4 + items.iter().map(|item| bytes_len(item.len())).sum::<usize>()
}

/// Cursor over an encoded buffer; every read is bounds checked.
pub struct ByteReader<'a> {
    src: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Starts reading at the first byte of `src`.
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, off: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.src.len() - self.off
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .off
            .checked_add(len)
            .ok_or(StorageError::Corruption("record field length overflow"))?;
        if end > self.src.len() {
            return Err(StorageError::Corruption("record truncated"));
        }
        let out = &self.src[self.off..end];
        self.off = end;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a bool; bytes other than 0 and 1 are corruption.
    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(StorageError::Corruption("invalid boolean byte")),
        }
    }

    /// Reads a big-endian `u16`.
    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    /// Reads a big-endian `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    /// Reads a big-endian `i32`.
    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    /// Reads a big-endian `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// Reads a big-endian `i64`.
    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// Reads an LSN written by [`ByteWriter::put_lsn`].
    pub fn lsn(&mut self) -> Result<Lsn> {
        Ok(Lsn::from_be_bytes(self.take_array()?))
    }

    /// Reads a `u32`-length-prefixed byte field.
    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a list written by [`ByteWriter::put_byte_list`].
    pub fn byte_list(&mut self) -> Result<Vec<Vec<u8>>> {
        let count = self.u32()? as usize;
        // Each item needs at least its 4-byte prefix.
        if count > self.remaining() / 4 {
            return Err(StorageError::Corruption("byte list count exceeds payload"));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.bytes()?);
        }
        Ok(items)
    }

    /// Fails unless every byte was consumed.
    pub fn finish(self) -> Result<()> {
        if self.off != self.src.len() {
            return Err(StorageError::Corruption("trailing bytes after record payload"));
        }
        Ok(())
    }
}
