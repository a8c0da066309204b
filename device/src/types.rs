//! Raw byte-buffer and single-sector abstractions.
//!
//! These are the only two shapes of data that ever cross the boundary
//! between the filesystem core and the block device: a bare [`Buffer`] of
//! bytes, and a [`Block`] that additionally remembers which sector on disk
//! it came from. Everything above this layer (inodes, directory entries,
//! the free-map bitmap) is just bytes serialized into one of these.

use super::error::{DeviceError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::io::prelude::*;
use std::io::{Cursor, SeekFrom};

/// A heap-allocated, fixed-length byte buffer.
///
/// Buffers never resize after construction; this lets [`Block`] guarantee
/// that every sector it hands out is exactly [`crate::SECTOR_SIZE`] bytes,
/// which the rest of the crate relies on without re-checking.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Buffer {
    contents: Box<[u8]>,
}

impl Buffer {
    /// Wrap an existing byte slice as a buffer.
    pub fn new(data: Box<[u8]>) -> Buffer {
        Buffer { contents: data }
    }

    /// Create an all-zero buffer of `len` bytes.
    pub fn new_zero(len: u64) -> Buffer {
        Buffer {
            contents: vec![0; len as usize].into_boxed_slice(),
        }
    }

    /// Length of the buffer, in bytes.
    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    /// Whether the buffer holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Borrow the raw contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.contents
    }

    /// Mutably borrow the raw contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.contents
    }

    /// Read `data.len()` bytes starting at `offset`. Errors if that range
    /// falls outside the buffer.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(DeviceError::BufferBounds(
                "read past the end of the buffer",
            ));
        }
        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        c.read_exact(data).map_err(DeviceError::from)
    }

    /// Write `data` starting at `offset`. Errors if that range falls
    /// outside the buffer; on error the buffer is left unchanged.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(DeviceError::BufferBounds(
                "write past the end of the buffer",
            ));
        }
        let mut c = Cursor::new(&mut self.contents[..]);
        c.seek(SeekFrom::Start(offset))?;
        c.write_all(data).map_err(DeviceError::from)
    }

    /// Deserialize a `DeserializeOwned` record starting at `offset`.
    pub fn deserialize_from<S: DeserializeOwned>(&self, offset: u64) -> Result<S> {
        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        Ok(bincode::deserialize_from(c)?)
    }

    /// Serialize `value` and write it at `offset`, going through
    /// [`Buffer::write_data`] so bounds errors are reported consistently.
    pub fn serialize_into<S: Serialize>(&mut self, value: &S, offset: u64) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.write_data(&bytes, offset)
    }
}

/// A single on-disk sector: a [`Buffer`] that remembers its own sector
/// index, so callers can pass it straight to
/// [`crate::controller::Device::write_sector`] without threading the index
/// separately.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Block {
    /// Index of this sector on the device.
    pub sector: u64,
    buf: Buffer,
}

impl Block {
    /// Wrap `data` as the contents of sector `sector`.
    pub fn new(sector: u64, data: Box<[u8]>) -> Block {
        Block {
            sector,
            buf: Buffer::new(data),
        }
    }

    /// An all-zero sector of `len` bytes.
    pub fn new_zero(sector: u64, len: u64) -> Block {
        Block {
            sector,
            buf: Buffer::new_zero(len),
        }
    }

    /// Length of this sector's contents, in bytes.
    pub fn len(&self) -> u64 {
        self.buf.len()
    }

    /// Whether this sector holds zero bytes (never true for a mounted
    /// device; only relevant to unit tests of the raw buffer helpers).
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow this sector's raw contents.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Read `data.len()` bytes starting at `offset` within this sector.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> Result<()> {
        self.buf.read_data(data, offset)
    }

    /// Write `data` starting at `offset` within this sector.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.buf.write_data(data, offset)
    }

    /// Deserialize a record stored at `offset` within this sector.
    pub fn deserialize_from<S: DeserializeOwned>(&self, offset: u64) -> Result<S> {
        self.buf.deserialize_from(offset)
    }

    /// Serialize and write a record at `offset` within this sector.
    pub fn serialize_into<S: Serialize>(&mut self, value: &S, offset: u64) -> Result<()> {
        self.buf.serialize_into(value, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    const SECTOR: u64 = 64;

    #[test]
    fn raw_rw_roundtrip() {
        let mut b = Block::new_zero(3, SECTOR);
        assert_eq!(b.as_slice(), vec![0; SECTOR as usize]);

        let data = vec![5u8; 5];
        b.write_data(&data, 10).unwrap();
        let mut out = vec![0u8; 5];
        b.read_data(&mut out, 8).unwrap();
        assert_eq!(out, vec![0, 0, 5, 5, 5]);
    }

    #[test]
    fn out_of_bounds_rw_errors() {
        let mut b = Block::new_zero(0, SECTOR);
        let one = vec![1u8];
        assert!(b.write_data(&one, SECTOR).is_err());
        assert!(b.read_data(&mut [0u8], SECTOR).is_err());
        // writing exactly up to the end is fine
        assert!(b.write_data(&[], SECTOR).is_ok());
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
    struct Point(u32, u32);

    #[test]
    fn serialize_roundtrip() {
        let mut b = Block::new_zero(1, SECTOR);
        let p = Point(7, 9);
        b.serialize_into(&p, 0).unwrap();
        assert_eq!(b.deserialize_from::<Point>(0).unwrap(), p);
    }
}
