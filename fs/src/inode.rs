//! Inode layer: on-disk inode layout, direct/indirect/doubly-indirect
//! address translation, and the process-wide open-inode table.
//!
//! An inode's "number" is simply the sector it lives at — there is no
//! separate inode-number namespace. A file's data sectors are reached
//! through 123 direct pointers, one indirect block (128 more pointers), and
//! one doubly-indirect block (128 pointers to indirect blocks, 16384
//! sectors). Growing a file allocates sectors lazily, one at a time, via
//! the free map, and always zero-fills a new sector before linking its
//! pointer into the tree above it — a reader can never observe a sector
//! whose pointer is published before its content is valid.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fs_device::controller::Device;
use fs_device::types::Block;
use fs_device::SECTOR_SIZE;
use lazy_static::lazy_static;
use log::trace;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::error::{FsError, Result};
use crate::free_map::FreeMap;

/// Number of direct sector pointers held inline in a disk inode.
pub const DIRECT_COUNT: usize = 123;
/// Number of sector pointers held in one indirect block.
pub const PTRS_PER_BLOCK: usize = SECTOR_SIZE as usize / std::mem::size_of::<u32>();
/// Sectors reachable through the doubly-indirect block.
pub const DOUBLY_CAPACITY: usize = PTRS_PER_BLOCK * PTRS_PER_BLOCK;
/// Largest file size this layer can address, in sectors.
pub const MAX_FILE_SECTORS: usize = DIRECT_COUNT + PTRS_PER_BLOCK + DOUBLY_CAPACITY;

const MAGIC: u32 = 0x494E_4F44;

lazy_static! {
    /// Serialized size of a [`DiskInode`], computed once so the 512-byte
    /// budget is checked against the real wire format rather than hand
    /// arithmetic.
    static ref DISK_INODE_SIZE: u64 = bincode::serialized_size(&DiskInode::default()).unwrap();
    /// Serialized size of an [`IndirectBlock`]; must land exactly on
    /// `SECTOR_SIZE` since it occupies a whole sector with nothing else in it.
    static ref INDIRECT_BLOCK_SIZE: u64 =
        bincode::serialized_size(&IndirectBlock::empty()).unwrap();
}

fn sectors_for_length(length: u32) -> usize {
    ((length as u64 + SECTOR_SIZE - 1) / SECTOR_SIZE) as usize
}

fn nonzero(sector: u32) -> Option<u32> {
    if sector == 0 {
        None
    } else {
        Some(sector)
    }
}

/// The on-disk inode record. Occupies exactly one sector.
///
/// `direct`/`ptrs` below are fixed-size arrays, not `Vec`s: bincode's default
/// config prefixes a `Vec` with an 8-byte length, which would push both this
/// struct and [`IndirectBlock`] past `SECTOR_SIZE`. `serde_big_array` is
/// needed since serde's own derive only covers arrays up to 32 elements.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct DiskInode {
    length: u32,
    magic: u32,
    is_directory: bool,
    #[serde(with = "BigArray")]
    direct: [u32; DIRECT_COUNT],
    indirect: u32,
    doubly_indirect: u32,
}

impl Default for DiskInode {
    fn default() -> Self {
        DiskInode {
            length: 0,
            magic: MAGIC,
            is_directory: false,
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            doubly_indirect: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct IndirectBlock {
    #[serde(with = "BigArray")]
    ptrs: [u32; PTRS_PER_BLOCK],
}

impl IndirectBlock {
    fn empty() -> IndirectBlock {
        IndirectBlock {
            ptrs: [0; PTRS_PER_BLOCK],
        }
    }
}

impl DiskInode {
    /// Read-only lookup of the data sector backing file-relative sector
    /// index `index`. Returns `None` for a sparse hole.
    fn index_sector(&self, ctx: &Ctx, index: usize) -> Result<Option<u32>> {
        if index < DIRECT_COUNT {
            return Ok(nonzero(self.direct[index]));
        }
        let index = index - DIRECT_COUNT;
        if index < PTRS_PER_BLOCK {
            let Some(indirect) = nonzero(self.indirect) else {
                return Ok(None);
            };
            let blk = ctx.read_indirect(indirect)?;
            return Ok(nonzero(blk.ptrs[index]));
        }
        let index = index - PTRS_PER_BLOCK;
        if index < DOUBLY_CAPACITY {
            let Some(doubly) = nonzero(self.doubly_indirect) else {
                return Ok(None);
            };
            let outer = ctx.read_indirect(doubly)?;
            let o_idx = index / PTRS_PER_BLOCK;
            let i_idx = index % PTRS_PER_BLOCK;
            let Some(inner_sector) = nonzero(outer.ptrs[o_idx]) else {
                return Ok(None);
            };
            let inner = ctx.read_indirect(inner_sector)?;
            return Ok(nonzero(inner.ptrs[i_idx]));
        }
        Err(FsError::BadRange)
    }

    /// Lookup-or-allocate of the data sector backing file-relative sector
    /// index `index`, growing the direct/indirect/doubly-indirect tree as
    /// needed. Every newly allocated sector is zero-filled on disk before
    /// its pointer is written into the parent block.
    fn ensure_sector(&mut self, ctx: &Ctx, index: usize) -> Result<u32> {
        if index >= MAX_FILE_SECTORS {
            return Err(FsError::BadRange);
        }
        if index < DIRECT_COUNT {
            if self.direct[index] == 0 {
                self.direct[index] = ctx.alloc_zeroed()?;
            }
            return Ok(self.direct[index]);
        }
        let index = index - DIRECT_COUNT;
        if index < PTRS_PER_BLOCK {
            if self.indirect == 0 {
                self.indirect = ctx.alloc_zeroed()?;
                ctx.write_indirect(self.indirect, &IndirectBlock::empty())?;
            }
            let mut blk = ctx.read_indirect(self.indirect)?;
            if blk.ptrs[index] == 0 {
                blk.ptrs[index] = ctx.alloc_zeroed()?;
                ctx.write_indirect(self.indirect, &blk)?;
            }
            return Ok(blk.ptrs[index]);
        }
        let index = index - PTRS_PER_BLOCK;
        if index < DOUBLY_CAPACITY {
            if self.doubly_indirect == 0 {
                self.doubly_indirect = ctx.alloc_zeroed()?;
                ctx.write_indirect(self.doubly_indirect, &IndirectBlock::empty())?;
            }
            let mut outer = ctx.read_indirect(self.doubly_indirect)?;
            let o_idx = index / PTRS_PER_BLOCK;
            let i_idx = index % PTRS_PER_BLOCK;
            if outer.ptrs[o_idx] == 0 {
                let new_inner = ctx.alloc_zeroed()?;
                ctx.write_indirect(new_inner, &IndirectBlock::empty())?;
                outer.ptrs[o_idx] = new_inner;
                ctx.write_indirect(self.doubly_indirect, &outer)?;
            }
            let inner_sector = outer.ptrs[o_idx];
            let mut inner = ctx.read_indirect(inner_sector)?;
            if inner.ptrs[i_idx] == 0 {
                inner.ptrs[i_idx] = ctx.alloc_zeroed()?;
                ctx.write_indirect(inner_sector, &inner)?;
            }
            return Ok(inner.ptrs[i_idx]);
        }
        Err(FsError::BadRange)
    }

    /// Release every data sector, indirect block, and doubly-indirect block
    /// reachable from this inode. Mirrors `ensure_sector`'s tree shape;
    /// unreached ("None") branches are skipped.
    fn deallocate(&mut self, ctx: &Ctx) -> Result<()> {
        let sectors = sectors_for_length(self.length);

        for slot in self.direct.iter_mut().take(sectors.min(DIRECT_COUNT)) {
            ctx.free(*slot);
            *slot = 0;
        }

        if sectors > DIRECT_COUNT {
            let indirect_count = (sectors - DIRECT_COUNT).min(PTRS_PER_BLOCK);
            if self.indirect != 0 {
                let blk = ctx.read_indirect(self.indirect)?;
                for slot in blk.ptrs.iter().take(indirect_count) {
                    ctx.free(*slot);
                }
                ctx.free(self.indirect);
                self.indirect = 0;
            }
        }

        if sectors > DIRECT_COUNT + PTRS_PER_BLOCK {
            let doubly_sectors = sectors - DIRECT_COUNT - PTRS_PER_BLOCK;
            if self.doubly_indirect != 0 {
                let outer = ctx.read_indirect(self.doubly_indirect)?;
                let outer_count = (doubly_sectors + PTRS_PER_BLOCK - 1) / PTRS_PER_BLOCK;
                for (o, outer_ptr) in outer.ptrs.iter().take(outer_count).enumerate() {
                    if *outer_ptr == 0 {
                        continue;
                    }
                    let inner = ctx.read_indirect(*outer_ptr)?;
                    let remaining = doubly_sectors - o * PTRS_PER_BLOCK;
                    let inner_count = remaining.min(PTRS_PER_BLOCK);
                    for slot in inner.ptrs.iter().take(inner_count) {
                        ctx.free(*slot);
                    }
                    ctx.free(*outer_ptr);
                }
                ctx.free(self.doubly_indirect);
                self.doubly_indirect = 0;
            }
        }

        Ok(())
    }
}

/// The collaborators an inode operation needs: a way to read/write sectors,
/// and a way to allocate/release them. Bundled so inode methods don't carry
/// two separate parameters through every call.
pub(crate) struct Ctx<'a> {
    pub device: &'a Mutex<Device>,
    pub free_map: &'a Mutex<FreeMap>,
}

impl<'a> Ctx<'a> {
    pub fn new(device: &'a Mutex<Device>, free_map: &'a Mutex<FreeMap>) -> Ctx<'a> {
        Ctx { device, free_map }
    }

    fn read_block(&self, sector: u32) -> Result<Block> {
        Ok(self.device.lock().unwrap().read_sector(sector as u64)?)
    }

    fn write_block(&self, b: &Block) -> Result<()> {
        self.device.lock().unwrap().write_sector(b)?;
        Ok(())
    }

    fn read_indirect(&self, sector: u32) -> Result<IndirectBlock> {
        Ok(self.read_block(sector)?.deserialize_from(0)?)
    }

    fn write_indirect(&self, sector: u32, ib: &IndirectBlock) -> Result<()> {
        let mut blk = Block::new_zero(sector as u64, SECTOR_SIZE);
        blk.serialize_into(ib, 0)?;
        self.write_block(&blk)
    }

    fn alloc_zeroed(&self) -> Result<u32> {
        let sector = self.free_map.lock().unwrap().allocate(1)? as u32;
        let zero = Block::new_zero(sector as u64, SECTOR_SIZE);
        self.write_block(&zero)?;
        Ok(sector)
    }

    pub(crate) fn free(&self, sector: u32) {
        if sector != 0 {
            self.free_map.lock().unwrap().release(sector as u64, 1);
        }
    }

    /// Allocate one sector from the free map without zero-filling it. Used
    /// by the mount layer to reserve [`crate::mount::FREE_MAP_SECTOR`] and
    /// [`crate::mount::ROOT_DIR_SECTOR`] up front, and by the directory
    /// layer to reserve a fresh inode's own header sector before
    /// `inode::create` writes into it.
    pub fn alloc_sector(&self) -> Result<u32> {
        Ok(self.free_map.lock().unwrap().allocate(1)? as u32)
    }

    fn read_disk_inode(&self, sector: u32) -> Result<DiskInode> {
        let di: DiskInode = self.read_block(sector)?.deserialize_from(0)?;
        if di.magic != MAGIC {
            return Err(FsError::NotFound("no inode at this sector"));
        }
        Ok(di)
    }

    fn write_disk_inode(&self, sector: u32, di: &DiskInode) -> Result<()> {
        let mut blk = Block::new_zero(sector as u64, SECTOR_SIZE);
        blk.serialize_into(di, 0)?;
        self.write_block(&blk)
    }
}

/// Initialize a fresh, zero-length inode at `sector`. The caller is
/// responsible for having reserved `sector` in the free map first.
pub fn create(ctx: &Ctx, sector: u32, is_directory: bool) -> Result<()> {
    debug_assert!(*DISK_INODE_SIZE <= SECTOR_SIZE);
    debug_assert_eq!(*INDIRECT_BLOCK_SIZE, SECTOR_SIZE);
    let disk = DiskInode {
        is_directory,
        ..DiskInode::default()
    };
    ctx.write_disk_inode(sector, &disk)
}

pub(crate) struct InodeState {
    disk: DiskInode,
    open_count: u64,
    removed: bool,
    deny_write_count: u64,
    parent_sector: u32,
}

/// An open inode: the in-memory counterpart of a [`DiskInode`], shared by
/// every handle on the same sector via the [`InodeTable`].
pub struct InodeHandle {
    /// The sector this inode's header lives at — doubles as its inode
    /// number.
    pub sector: u32,
    state: Mutex<InodeState>,
}

impl InodeHandle {
    /// Whether this inode is a directory.
    pub fn is_directory(&self) -> bool {
        self.state.lock().unwrap().disk.is_directory
    }

    /// Current length in bytes.
    pub fn length(&self) -> u64 {
        self.state.lock().unwrap().disk.length as u64
    }

    /// How many open handles share this inode.
    pub fn open_count(&self) -> u64 {
        self.state.lock().unwrap().open_count
    }

    /// Whether this inode has been marked for deletion (pending the last
    /// close).
    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }

    /// Sector of this inode's directory parent. Meaningful only when
    /// `is_directory()`; set by the directory layer at creation and
    /// refreshed on each traversal.
    pub fn parent_sector(&self) -> u32 {
        self.state.lock().unwrap().parent_sector
    }

    /// Record `parent` as this inode's directory parent.
    pub fn set_parent_sector(&self, parent: u32) {
        self.state.lock().unwrap().parent_sector = parent;
    }

    /// Mark this inode for deletion. It is actually deallocated once its
    /// open count reaches zero.
    pub fn mark_removed(&self) {
        self.state.lock().unwrap().removed = true;
    }

    /// Increment the deny-write count, forbidding further writers until a
    /// matching [`InodeHandle::allow_write`].
    pub fn deny_write(&self) {
        self.state.lock().unwrap().deny_write_count += 1;
    }

    /// Decrement the deny-write count.
    pub fn allow_write(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.deny_write_count > 0);
        st.deny_write_count -= 1;
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Reads that run
    /// past the current length are truncated; reads into a sparse hole
    /// come back as zeroes. Returns the number of bytes actually read.
    pub(crate) fn read_at(&self, ctx: &Ctx, buf: &mut [u8], offset: u64) -> Result<usize> {
        let st = self.state.lock().unwrap();
        let len = st.disk.length as u64;
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }
        let avail = ((len - offset).min(buf.len() as u64)) as usize;
        let mut done = 0usize;
        while done < avail {
            let pos = offset + done as u64;
            let sector_idx = (pos / SECTOR_SIZE) as usize;
            let sector_ofs = (pos % SECTOR_SIZE) as usize;
            let chunk = (SECTOR_SIZE as usize - sector_ofs).min(avail - done);
            match st.disk.index_sector(ctx, sector_idx)? {
                Some(sector) => {
                    let blk = ctx.read_block(sector)?;
                    blk.read_data(&mut buf[done..done + chunk], sector_ofs as u64)?;
                }
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(avail)
    }

    /// Write `data` starting at `offset`, extending the file (and
    /// allocating sectors through the free map) if the write runs past the
    /// current length. Fails with [`FsError::DenyWrite`] while any reader
    /// holds a deny-write lock on this inode.
    pub(crate) fn write_at(&self, ctx: &Ctx, data: &[u8], offset: u64) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        if st.deny_write_count > 0 {
            return Err(FsError::DenyWrite);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        if end > (MAX_FILE_SECTORS as u64) * SECTOR_SIZE {
            return Err(FsError::BadRange);
        }

        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let sector_idx = (pos / SECTOR_SIZE) as usize;
            let sector_ofs = (pos % SECTOR_SIZE) as usize;
            let chunk = (SECTOR_SIZE as usize - sector_ofs).min(data.len() - done);
            let sector = st.disk.ensure_sector(ctx, sector_idx)?;
            let mut blk = ctx.read_block(sector)?;
            blk.write_data(&data[done..done + chunk], sector_ofs as u64)?;
            ctx.write_block(&blk)?;
            done += chunk;
        }

        if end > st.disk.length as u64 {
            st.disk.length = end as u32;
        }
        ctx.write_disk_inode(self.sector, &st.disk)?;
        Ok(done)
    }
}

/// The process-wide table of currently-open inodes, keyed by sector.
/// Concurrent opens of the same sector share one [`InodeHandle`] and one
/// reference count, matching the single-inode-per-sector invariant the
/// directory and path layers depend on.
pub struct InodeTable {
    entries: Mutex<HashMap<u32, Arc<InodeHandle>>>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// An empty table, as at mount time.
    pub fn new() -> InodeTable {
        InodeTable {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Open the inode at `sector`, reading it from disk on first open and
    /// sharing the in-memory handle on subsequent ones.
    pub fn open(&self, ctx: &Ctx, sector: u32) -> Result<Arc<InodeHandle>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&sector) {
            existing.state.lock().unwrap().open_count += 1;
            return Ok(existing.clone());
        }
        let disk = ctx.read_disk_inode(sector)?;
        let handle = Arc::new(InodeHandle {
            sector,
            state: Mutex::new(InodeState {
                disk,
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                parent_sector: sector,
            }),
        });
        entries.insert(sector, handle.clone());
        trace!("opened inode at sector {}", sector);
        Ok(handle)
    }

    /// Take another reference on an already-open inode.
    pub fn reopen(&self, handle: &Arc<InodeHandle>) -> Arc<InodeHandle> {
        handle.state.lock().unwrap().open_count += 1;
        handle.clone()
    }

    /// Drop a reference to `handle`. Once the open count reaches zero, the
    /// handle is evicted from the table; if it had been marked removed, its
    /// data sectors and header sector are deallocated at that point.
    pub fn close(&self, ctx: &Ctx, handle: Arc<InodeHandle>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let should_deallocate = {
            let mut st = handle.state.lock().unwrap();
            debug_assert!(st.open_count > 0);
            st.open_count -= 1;
            if st.open_count == 0 {
                entries.remove(&handle.sector);
                st.removed
            } else {
                false
            }
        };
        drop(entries);

        if should_deallocate {
            handle.state.lock().unwrap().disk.deallocate(ctx)?;
            ctx.free(handle.sector);
            trace!("deallocated removed inode at sector {}", handle.sector);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_device::controller::Device;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::{Path, PathBuf};

    const NSECTORS: u64 = 256;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("target-test-images-inode-".to_string() + name);
        path.push("img");
        if path.exists() {
            remove_file(&path).unwrap();
        }
        create_dir_all(path.parent().unwrap()).unwrap();
        path
    }

    fn disk_destruct(dev: Device, path: &Path) {
        dev.destroy();
        let _ = remove_dir(path.parent().unwrap());
    }

    fn fresh(name: &str) -> (PathBuf, Mutex<Device>, Mutex<FreeMap>) {
        let path = disk_prep_path(name);
        let dev = Device::create(&path, NSECTORS).unwrap();
        let mut fm = FreeMap::new_all_free(NSECTORS);
        fm.reserve(0);
        (path, Mutex::new(dev), Mutex::new(fm))
    }

    #[test]
    fn create_read_write_within_direct_range() {
        let (path, dev, fm) = fresh("direct");
        let ctx = Ctx::new(&dev, &fm);
        let sector = ctx.alloc_sector().unwrap();
        create(&ctx, sector, false).unwrap();

        let table = InodeTable::new();
        let handle = table.open(&ctx, sector).unwrap();
        assert_eq!(handle.length(), 0);

        let data = b"hello filesystem";
        let written = handle.write_at(&ctx, data, 0).unwrap();
        assert_eq!(written, data.len());
        assert_eq!(handle.length(), data.len() as u64);

        let mut buf = vec![0u8; data.len()];
        let read = handle.read_at(&ctx, &mut buf, 0).unwrap();
        assert_eq!(read, data.len());
        assert_eq!(&buf, data);

        table.close(&ctx, handle).unwrap();
        drop(ctx);
        disk_destruct(dev.into_inner().unwrap(), &path);
    }

    #[test]
    fn grows_through_indirect_block() {
        let (path, dev, fm) = fresh("indirect");
        let ctx = Ctx::new(&dev, &fm);
        let sector = ctx.alloc_sector().unwrap();
        create(&ctx, sector, false).unwrap();

        let table = InodeTable::new();
        let handle = table.open(&ctx, sector).unwrap();

        // Land a write past the direct range, into the indirect block.
        let offset = (DIRECT_COUNT as u64 + 1) * SECTOR_SIZE;
        handle.write_at(&ctx, b"past direct", offset).unwrap();
        assert_eq!(handle.length(), offset + 11);

        let mut hole = vec![0xAAu8; SECTOR_SIZE as usize];
        let read = handle.read_at(&ctx, &mut hole, DIRECT_COUNT as u64 * SECTOR_SIZE).unwrap();
        assert_eq!(read, SECTOR_SIZE as usize);
        assert!(hole.iter().all(|b| *b == 0), "unwritten sector should read as zero");

        table.close(&ctx, handle).unwrap();
        drop(ctx);
        disk_destruct(dev.into_inner().unwrap(), &path);
    }

    #[test]
    fn remove_defers_deallocation_until_last_close() {
        let (path, dev, fm) = fresh("removeclose");
        let ctx = Ctx::new(&dev, &fm);
        let sector = ctx.alloc_sector().unwrap();
        create(&ctx, sector, false).unwrap();

        let table = InodeTable::new();
        let a = table.open(&ctx, sector).unwrap();
        let b = table.reopen(&a);
        a.write_at(&ctx, b"data", 0).unwrap();
        a.mark_removed();

        assert!(fm.lock().unwrap().is_free(sector) == false);
        table.close(&ctx, a).unwrap();
        assert!(
            !fm.lock().unwrap().is_free(sector),
            "sector must stay reserved while a second handle is open"
        );
        table.close(&ctx, b).unwrap();
        assert!(
            fm.lock().unwrap().is_free(sector),
            "sector must be released once the last handle closes"
        );

        drop(ctx);
        disk_destruct(dev.into_inner().unwrap(), &path);
    }
}
