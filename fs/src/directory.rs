//! Directories are regular files whose contents are a packed array of
//! fixed-size entries. This module only knows how to scan, add to, and
//! remove from that array — path splitting and `.`/`..` handling live in
//! [`crate::path`].

use std::sync::{Arc, Mutex};

use fs_device::SECTOR_SIZE;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::inode::{Ctx, InodeHandle, InodeTable};

/// Maximum length of a single path component.
pub const NAME_MAX: usize = 14;
/// Number of entries a freshly created directory is pre-sized to hold.
pub const INITIAL_ENTRY_CAPACITY: u64 = 16;

#[derive(Serialize, Deserialize, Clone, Debug)]
struct RawDirEntry {
    in_use: bool,
    name: [u8; NAME_MAX + 1],
    inode_sector: u32,
}

impl Default for RawDirEntry {
    fn default() -> Self {
        RawDirEntry {
            in_use: false,
            name: [0u8; NAME_MAX + 1],
            inode_sector: 0,
        }
    }
}

lazy_static! {
    /// Serialized size of one [`RawDirEntry`], used to compute byte offsets
    /// for entry `i` as `i * ENTRY_SIZE`.
    static ref ENTRY_SIZE: u64 = bincode::serialized_size(&RawDirEntry::default()).unwrap();
}

fn encode_name(name: &str) -> Result<[u8; NAME_MAX + 1]> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::NameInvalid("name is empty or reserved"));
    }
    let bytes = name.as_bytes();
    if bytes.len() > NAME_MAX {
        return Err(FsError::NameInvalid("name exceeds NAME_MAX"));
    }
    let mut buf = [0u8; NAME_MAX + 1];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

fn decode_name(raw: &[u8; NAME_MAX + 1]) -> String {
    let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..nul]).into_owned()
}

/// An open directory: an inode known to hold directory entries, plus this
/// handle's own read cursor for [`Directory::readdir`].
pub struct Directory {
    inode: Arc<InodeHandle>,
    cursor: Mutex<u64>,
}

impl Directory {
    /// Initialize a directory inode at `sector`, sized to hold
    /// `entry_capacity` entries (all initially unused). The sector must
    /// already be reserved in the free map.
    pub fn create(ctx: &Ctx, table: &InodeTable, sector: u32, entry_capacity: u64) -> Result<()> {
        crate::inode::create(ctx, sector, true)?;
        let handle = table.open(ctx, sector)?;
        let zeros = vec![0u8; (entry_capacity * *ENTRY_SIZE) as usize];
        handle.write_at(ctx, &zeros, 0)?;
        table.close(ctx, handle)?;
        Ok(())
    }

    /// Open the directory at `sector`.
    pub fn open(ctx: &Ctx, table: &InodeTable, sector: u32) -> Result<Directory> {
        let handle = table.open(ctx, sector)?;
        if !handle.is_directory() {
            table.close(ctx, handle)?;
            return Err(FsError::NotFound("inode is not a directory"));
        }
        Ok(Directory {
            inode: handle,
            cursor: Mutex::new(0),
        })
    }

    /// Open the root directory.
    pub fn open_root(ctx: &Ctx, table: &InodeTable, root_sector: u32) -> Result<Directory> {
        Self::open(ctx, table, root_sector)
    }

    /// Take a second, independent handle (own read cursor) on the same
    /// underlying inode.
    pub fn reopen(&self, table: &InodeTable) -> Directory {
        Directory {
            inode: table.reopen(&self.inode),
            cursor: Mutex::new(0),
        }
    }

    /// Close this handle.
    pub fn close(self, ctx: &Ctx, table: &InodeTable) -> Result<()> {
        table.close(ctx, self.inode)
    }

    /// Sector this directory's inode lives at.
    pub fn sector(&self) -> u32 {
        self.inode.sector
    }

    /// The underlying inode handle, for callers (the path resolver) that
    /// need to read/set the parent back-pointer directly.
    pub fn inode(&self) -> &Arc<InodeHandle> {
        &self.inode
    }

    /// Wrap an already-open directory inode handle. Used by the path
    /// resolver once [`Directory::lookup`] has opened a child and verified
    /// it is a directory.
    pub(crate) fn from_handle(inode: Arc<InodeHandle>) -> Directory {
        Directory {
            inode,
            cursor: Mutex::new(0),
        }
    }

    /// Open this directory's parent, following its back-pointer. The root
    /// directory's parent is itself.
    pub fn parent(&self, ctx: &Ctx, table: &InodeTable) -> Result<Directory> {
        Self::open(ctx, table, self.inode.parent_sector())
    }

    fn entry_count(&self) -> u64 {
        self.inode.length() / *ENTRY_SIZE
    }

    fn read_entry(&self, ctx: &Ctx, index: u64) -> Result<RawDirEntry> {
        let mut buf = vec![0u8; *ENTRY_SIZE as usize];
        self.inode.read_at(ctx, &mut buf, index * *ENTRY_SIZE)?;
        Ok(bincode::deserialize(&buf)?)
    }

    fn write_entry(&self, ctx: &Ctx, index: u64, entry: &RawDirEntry) -> Result<()> {
        let bytes = bincode::serialize(entry)?;
        self.inode.write_at(ctx, &bytes, index * *ENTRY_SIZE)?;
        Ok(())
    }

    /// Look up `name` among this directory's in-use entries and, if found,
    /// open its inode. `.` and `..` are never stored here and are not
    /// resolved by this method — see [`crate::path`].
    pub fn lookup(&self, ctx: &Ctx, table: &InodeTable, name: &str) -> Result<Arc<InodeHandle>> {
        for i in 0..self.entry_count() {
            let entry = self.read_entry(ctx, i)?;
            if entry.in_use && decode_name(&entry.name) == name {
                return table.open(ctx, entry.inode_sector);
            }
        }
        Err(FsError::NotFound("no such directory entry"))
    }

    /// Whether `name` is present among the in-use entries, without opening
    /// anything.
    pub fn contains(&self, ctx: &Ctx, name: &str) -> Result<bool> {
        for i in 0..self.entry_count() {
            let entry = self.read_entry(ctx, i)?;
            if entry.in_use && decode_name(&entry.name) == name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Add an entry named `name` pointing at `inode_sector`. Fails on an
    /// invalid name or a name collision. Reuses the first freed slot found
    /// by a linear scan; otherwise appends, growing the directory file
    /// through the ordinary write-extension path.
    pub fn add(&self, ctx: &Ctx, name: &str, inode_sector: u32) -> Result<()> {
        let encoded = encode_name(name)?;

        let mut free_slot = None;
        for i in 0..self.entry_count() {
            let entry = self.read_entry(ctx, i)?;
            if entry.in_use {
                if decode_name(&entry.name) == name {
                    return Err(FsError::Exists(name.to_string()));
                }
            } else if free_slot.is_none() {
                free_slot = Some(i);
            }
        }

        let slot = free_slot.unwrap_or_else(|| self.entry_count());
        self.write_entry(
            ctx,
            slot,
            &RawDirEntry {
                in_use: true,
                name: encoded,
                inode_sector,
            },
        )
    }

    /// Remove the entry named `name`. Fails if absent. If the entry refers
    /// to a directory, fails with [`FsError::NotEmpty`] unless it holds no
    /// entries, or [`FsError::InUse`] if any other task has it open. On
    /// success the target inode is marked removed and its temporary handle
    /// closed, deallocating it immediately if nothing else has it open.
    pub fn remove(&self, ctx: &Ctx, table: &InodeTable, name: &str) -> Result<()> {
        let mut found = None;
        for i in 0..self.entry_count() {
            let entry = self.read_entry(ctx, i)?;
            if entry.in_use && decode_name(&entry.name) == name {
                found = Some((i, entry));
                break;
            }
        }
        let (index, entry) = found.ok_or(FsError::NotFound("no such directory entry"))?;

        let target = table.open(ctx, entry.inode_sector)?;
        if target.is_directory() {
            if target.open_count() > 1 {
                table.close(ctx, target)?;
                return Err(FsError::InUse);
            }
            let victim = Directory {
                inode: target.clone(),
                cursor: Mutex::new(0),
            };
            if victim.readdir(ctx)?.is_some() {
                table.close(ctx, target)?;
                return Err(FsError::NotEmpty);
            }
        }

        self.write_entry(
            ctx,
            index,
            &RawDirEntry {
                in_use: false,
                ..entry
            },
        )?;
        target.mark_removed();
        table.close(ctx, target)
    }

    /// Return the next in-use entry's name, advancing this handle's read
    /// cursor. Returns `None` at end of directory. `.` and `..` never
    /// appear since they are never stored.
    pub fn readdir(&self, ctx: &Ctx) -> Result<Option<String>> {
        let mut cursor = self.cursor.lock().unwrap();
        let total = self.entry_count();
        let mut index = *cursor / *ENTRY_SIZE;
        while index < total {
            let entry = self.read_entry(ctx, index)?;
            index += 1;
            if entry.in_use {
                *cursor = index * *ENTRY_SIZE;
                return Ok(Some(decode_name(&entry.name)));
            }
        }
        *cursor = index * *ENTRY_SIZE;
        Ok(None)
    }
}
