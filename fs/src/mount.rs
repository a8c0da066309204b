//! Mount and format glue: acquire a block device, bootstrap or load the
//! free map, and open the root directory. This is the one layer allowed a
//! fatal error path — a missing device at mount time has nothing sensible
//! left to do.

use std::path::Path;
use std::sync::Mutex;

use fs_device::controller::Device;
use log::{debug, info, warn};

use crate::directory::{Directory, INITIAL_ENTRY_CAPACITY};
use crate::error::{FsError, Result};
use crate::free_map::FreeMap;
use crate::inode::{self, Ctx, InodeTable};
use crate::path::{self, Handle};
use crate::task::Task;

/// Sector reserved for the free map file's inode header.
pub const FREE_MAP_SECTOR: u32 = 0;
/// Sector reserved for the root directory's inode header.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// A mounted filesystem: a device, its free map, and the process-wide
/// open-inode table, bundled behind the facade operations in
/// [`crate::path`].
pub struct Filesystem {
    device: Mutex<Device>,
    free_map: Mutex<FreeMap>,
    inodes: InodeTable,
}

impl Filesystem {
    fn ctx(&self) -> Ctx<'_> {
        Ctx::new(&self.device, &self.free_map)
    }

    /// Format a brand-new device image of `nsectors` sectors at `path`:
    /// reserve the two well-known sectors, create the free map's own
    /// backing inode, create the root directory, and flush the bitmap once
    /// every sector it describes (including its own) has been allocated.
    pub fn format<P: AsRef<Path>>(path: P, nsectors: u64) -> Result<Filesystem> {
        let device = Mutex::new(Device::create(path, nsectors)?);

        let mut bitmap = FreeMap::new_all_free(nsectors);
        bitmap.reserve(FREE_MAP_SECTOR as u64);
        bitmap.reserve(ROOT_DIR_SECTOR as u64);
        let free_map = Mutex::new(bitmap);

        let inodes = InodeTable::new();
        {
            let ctx = Ctx::new(&device, &free_map);

            inode::create(&ctx, FREE_MAP_SECTOR, false)?;
            let fm_inode = inodes.open(&ctx, FREE_MAP_SECTOR)?;
            // Force the bitmap file's own backing sectors into existence.
            // The content written here is throwaway; it is overwritten
            // below once those very sectors are reflected in the bitmap.
            let placeholder = vec![0u8; FreeMap::byte_len(nsectors) as usize];
            fm_inode.write_at(&ctx, &placeholder, 0)?;

            Directory::create(&ctx, &inodes, ROOT_DIR_SECTOR, INITIAL_ENTRY_CAPACITY)?;
            let root = inodes.open(&ctx, ROOT_DIR_SECTOR)?;
            root.set_parent_sector(ROOT_DIR_SECTOR);
            inodes.close(&ctx, root)?;

            let final_bytes = free_map.lock().unwrap().as_bytes().to_vec();
            fm_inode.write_at(&ctx, &final_bytes, 0)?;
            inodes.close(&ctx, fm_inode)?;
        }

        info!("formatted {} sectors", nsectors);
        Ok(Filesystem {
            device,
            free_map,
            inodes,
        })
    }

    /// Mount an existing device image at `path`. Fails with
    /// [`FsError::DeviceAbsent`] if no image exists there; any other
    /// failure (size mismatch, corrupt free map) propagates as the
    /// ordinary error it is.
    pub fn mount<P: AsRef<Path>>(path: P, nsectors: u64) -> Result<Filesystem> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("no device image at {}", path.display());
            return Err(FsError::DeviceAbsent);
        }
        let device = Mutex::new(Device::open(path, nsectors)?);

        // The free map isn't loaded yet, but reading an inode's contents
        // never allocates, so a throwaway bitmap is a safe placeholder
        // while we read the real one off disk.
        let placeholder = Mutex::new(FreeMap::new_all_free(nsectors));
        let inodes = InodeTable::new();
        let loaded = {
            let ctx = Ctx::new(&device, &placeholder);
            let fm_inode = inodes.open(&ctx, FREE_MAP_SECTOR)?;
            let mut buf = vec![0u8; FreeMap::byte_len(nsectors) as usize];
            fm_inode.read_at(&ctx, &mut buf, 0)?;
            inodes.close(&ctx, fm_inode)?;
            buf
        };

        debug!("mounted {} sectors", nsectors);
        Ok(Filesystem {
            device,
            free_map: Mutex::new(FreeMap::from_bytes(nsectors, loaded)),
            inodes,
        })
    }

    /// Flush the free map to disk and hand back the underlying device.
    pub fn unmount(self) -> Result<Device> {
        {
            let ctx = self.ctx();
            let fm_inode = self.inodes.open(&ctx, FREE_MAP_SECTOR)?;
            let bytes = self.free_map.lock().unwrap().as_bytes().to_vec();
            fm_inode.write_at(&ctx, &bytes, 0)?;
            self.inodes.close(&ctx, fm_inode)?;
        }
        Ok(self.device.into_inner().unwrap())
    }

    /// `create(path, initial_size, is_directory)`.
    pub fn create(
        &self,
        task: &dyn Task,
        target: &str,
        initial_size: u64,
        is_directory: bool,
    ) -> Result<()> {
        path::create(
            &self.ctx(),
            &self.inodes,
            task,
            ROOT_DIR_SECTOR,
            target,
            initial_size,
            is_directory,
        )
    }

    /// `open(path)`.
    pub fn open(&self, task: &dyn Task, target: &str) -> Result<Handle> {
        path::open(&self.ctx(), &self.inodes, task, ROOT_DIR_SECTOR, target)
    }

    /// `remove(path)`.
    pub fn remove(&self, task: &dyn Task, target: &str) -> Result<()> {
        path::remove(&self.ctx(), &self.inodes, task, ROOT_DIR_SECTOR, target)
    }

    /// `chdir(path)`.
    pub fn chdir(&self, task: &mut dyn Task, target: &str) -> Result<()> {
        path::chdir(&self.ctx(), &self.inodes, task, ROOT_DIR_SECTOR, target)
    }

    /// `mkdir(path)` (`create` with `is_directory = true`, `initial_size = 0`).
    pub fn mkdir(&self, task: &dyn Task, target: &str) -> Result<()> {
        path::mkdir(&self.ctx(), &self.inodes, task, ROOT_DIR_SECTOR, target)
    }

    /// Close a handle previously returned by [`Filesystem::open`].
    pub fn close(&self, handle: Handle) -> Result<()> {
        handle.close(&self.ctx(), &self.inodes)
    }

    /// Read from `file` at its current position, advancing it.
    pub fn read(&self, file: &path::FileHandle, buf: &mut [u8]) -> Result<usize> {
        file.read(&self.ctx(), buf)
    }

    /// Write to `file` at its current position, advancing it and
    /// extending the file if needed.
    pub fn write(&self, file: &path::FileHandle, data: &[u8]) -> Result<usize> {
        file.write(&self.ctx(), data)
    }

    /// Move `file`'s position to `pos`.
    pub fn seek(&self, file: &path::FileHandle, pos: u64) {
        file.seek(pos);
    }

    /// `file`'s current position.
    pub fn tell(&self, file: &path::FileHandle) -> u64 {
        file.tell()
    }

    /// `file`'s current length in bytes.
    pub fn length(&self, file: &path::FileHandle) -> u64 {
        file.length()
    }

    /// Deny further writers on `file`'s underlying inode.
    pub fn deny_write(&self, file: &path::FileHandle) {
        file.deny_write();
    }

    /// Lift a previously asserted deny-write on `file`.
    pub fn allow_write(&self, file: &path::FileHandle) {
        file.allow_write();
    }

    /// The next entry name from `dir`, advancing its read cursor.
    pub fn readdir(&self, dir: &Directory) -> Result<Option<String>> {
        dir.readdir(&self.ctx())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SingleTask;
    use std::fs::{create_dir_all, remove_dir_all, remove_file};
    use std::path::PathBuf;

    const NSECTORS: u64 = 512;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("target-test-images-mount-".to_string() + name);
        if path.exists() {
            remove_dir_all(&path).unwrap();
        }
        create_dir_all(&path).unwrap();
        path.push("img");
        path
    }

    #[test]
    fn format_mount_cleanup_roundtrip() {
        let path = disk_prep_path("roundtrip");
        let fs = Filesystem::format(&path, NSECTORS).unwrap();
        let task = SingleTask::new();

        fs.create(&task, "/hello.txt", 0, false).unwrap();
        let handle = fs.open(&task, "/hello.txt").unwrap();
        let Handle::File(file) = handle else {
            panic!("expected a file handle");
        };
        file.write(&fs.ctx(), b"hello world").unwrap();
        file.close(&fs.ctx(), &fs.inodes).unwrap();

        let device = fs.unmount().unwrap();
        drop(device);

        let fs2 = Filesystem::mount(&path, NSECTORS).unwrap();
        let task2 = SingleTask::new();
        let handle = fs2.open(&task2, "/hello.txt").unwrap();
        let Handle::File(file) = handle else {
            panic!("expected a file handle");
        };
        let mut buf = vec![0u8; 11];
        file.read(&fs2.ctx(), &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
        file.close(&fs2.ctx(), &fs2.inodes).unwrap();

        let device = fs2.unmount().unwrap();
        device.destroy();
        let _ = remove_file(&path);
        let _ = remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn mount_without_image_is_fatal() {
        let path = disk_prep_path("absent");
        let _ = remove_file(&path);
        assert!(matches!(
            Filesystem::mount(&path, NSECTORS),
            Err(FsError::DeviceAbsent)
        ));
        let _ = remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn mkdir_and_chdir_relative_lookup() {
        let path = disk_prep_path("mkdirchdir");
        let fs = Filesystem::format(&path, NSECTORS).unwrap();
        let mut task = SingleTask::new();

        fs.mkdir(&task, "/sub").unwrap();
        fs.chdir(&mut task, "/sub").unwrap();
        fs.create(&task, "inner.txt", 0, false).unwrap();

        let handle = fs.open(&task, "inner.txt").unwrap();
        assert!(!handle.is_dir());
        fs.close(handle).unwrap();

        let device = fs.unmount().unwrap();
        device.destroy();
        let _ = remove_dir_all(path.parent().unwrap());
    }
}
