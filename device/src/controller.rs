//! A sector-addressed block device, backed by a memory-mapped file.
//!
//! The device and its contents are represented by a file on the host
//! filesystem, memory-mapped for the lifetime of the [`Device`]. Reads and
//! writes are synchronous and atomic per sector, matching the contract a
//! real block device driver would expose.
//!
//! No locking is performed on the backing file beyond what the OS does for
//! a single open handle; do not open the same image from two `Device`
//! instances concurrently.

use super::error::{DeviceError, Result};
use super::types::Block;
use super::SECTOR_SIZE;
use memmap::MmapMut;
use std::{
    fs::{remove_file, OpenOptions},
    path::{Path, PathBuf},
};

/// A fixed-size, sector-addressed block device.
#[derive(Debug)]
pub struct Device {
    /// Total number of sectors on this device.
    pub nsectors: u64,
    path: PathBuf,
    contents: MmapMut,
}

/// Whether a device path is expected to already exist.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
enum DiskState {
    New,
    Load,
}

impl Drop for Device {
    /// Persist outstanding writes before releasing the mapping, as long as
    /// the backing file hasn't since been removed out from under us.
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = self.contents.flush();
        }
    }
}

impl Device {
    fn open_mapped<P: AsRef<Path>>(path: P, nsectors: u64, ds: DiskState) -> Result<Device> {
        let path_buf = path.as_ref().to_path_buf();
        let size = SECTOR_SIZE * nsectors;
        let mmap = mmap_path(&path_buf, size, ds)?;
        Ok(Device {
            nsectors,
            path: path_buf,
            contents: mmap,
        })
    }

    /// Create a brand new, all-zero device image of `nsectors` sectors.
    /// Fails if `path` already exists.
    pub fn create<P: AsRef<Path>>(path: P, nsectors: u64) -> Result<Device> {
        Device::open_mapped(path, nsectors, DiskState::New)
    }

    /// Open an existing device image. Fails if `path` does not exist, or
    /// its size does not match `nsectors` sectors.
    pub fn open<P: AsRef<Path>>(path: P, nsectors: u64) -> Result<Device> {
        Device::open_mapped(path, nsectors, DiskState::Load)
    }

    /// Tear down this device and remove its backing file. Panics if the
    /// file cannot be removed — callers that want to keep the image should
    /// simply drop the `Device` instead.
    pub fn destroy(self) {
        let path = self.path.clone();
        drop(self);
        remove_file(&path).unwrap();
    }

    /// Total size of this device, in bytes.
    pub fn size_bytes(&self) -> u64 {
        SECTOR_SIZE * self.nsectors
    }

    /// Path of the file backing this device.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_sector(&self, idx: u64) -> Result<()> {
        if idx >= self.nsectors {
            return Err(DeviceError::Invalid("sector index out of bounds"));
        }
        Ok(())
    }

    /// Read sector `idx` from the device.
    pub fn read_sector(&self, idx: u64) -> Result<Block> {
        self.check_sector(idx)?;
        let start = (idx * SECTOR_SIZE) as usize;
        let end = start + SECTOR_SIZE as usize;
        Ok(Block::new(idx, self.contents[start..end].into()))
    }

    /// Write `b` to its own sector index. Fails if `b` is not exactly
    /// `SECTOR_SIZE` bytes, or its sector index is out of bounds.
    pub fn write_sector(&mut self, b: &Block) -> Result<()> {
        if b.len() != SECTOR_SIZE {
            return Err(DeviceError::Invalid("write of a non-sector-sized block"));
        }
        self.check_sector(b.sector)?;
        let start = (b.sector * SECTOR_SIZE) as usize;
        let end = start + SECTOR_SIZE as usize;
        self.contents[start..end].copy_from_slice(b.as_slice());
        Ok(())
    }
}

fn mmap_path(path: &Path, size: u64, ds: DiskState) -> Result<MmapMut> {
    let exists = path.exists();
    match (exists, ds) {
        (true, DiskState::New) => {
            return Err(DeviceError::Invalid(
                "tried to create a device at a pre-existing path",
            ))
        }
        (false, DiskState::Load) => {
            return Err(DeviceError::Invalid(
                "tried to open a device at a non-existing path",
            ))
        }
        _ => {}
    }

    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    if ds == DiskState::Load {
        if f.metadata()?.len() != size {
            return Err(DeviceError::Invalid(
                "device image size does not match the requested sector count",
            ));
        }
    } else {
        f.set_len(size)?;
    }

    let data = unsafe { memmap::MmapOptions::new().map_mut(&f)? };
    Ok(data)
}
