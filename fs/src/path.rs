//! Path splitting, `.`/`..` resolution, and the facade operations
//! (`create`/`open`/`remove`/`chdir`/`mkdir`) built on top of it.
//!
//! Two entry points do the actual walking: [`resolve_parent`] returns
//! `(open parent directory, basename)`, used by operations that need to
//! add or remove an entry; [`resolve`] walks all the way to a final
//! [`Handle`], used by `open` and `chdir`.

use std::sync::{Arc, Mutex};

use crate::directory::{Directory, INITIAL_ENTRY_CAPACITY};
use crate::error::{FsError, Result};
use crate::inode::{self, Ctx, InodeHandle, InodeTable};
use crate::task::Task;

fn split_path(path: &str) -> Result<(bool, Vec<String>)> {
    if path.is_empty() {
        return Err(FsError::InvalidPath("path is empty"));
    }
    let absolute = path.starts_with('/');
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Ok((absolute, segments))
}

fn step(ctx: &Ctx, table: &InodeTable, dir: Directory, seg: &str) -> Result<Directory> {
    match seg {
        "." => Ok(dir),
        ".." => {
            let parent = dir.parent(ctx, table)?;
            dir.close(ctx, table)?;
            Ok(parent)
        }
        _ => {
            let found = dir.lookup(ctx, table, seg);
            let found = match found {
                Ok(found) => found,
                Err(e) => {
                    dir.close(ctx, table)?;
                    return Err(e);
                }
            };
            if !found.is_directory() {
                table.close(ctx, found)?;
                dir.close(ctx, table)?;
                return Err(FsError::NotFound("path component is not a directory"));
            }
            found.set_parent_sector(dir.sector());
            dir.close(ctx, table)?;
            Ok(Directory::from_handle(found))
        }
    }
}

/// Resolve `path` to its containing directory and the final path
/// component, without doing anything with the basename. Absolute paths (or
/// a task with no working directory) start from root; relative paths start
/// from a reopened handle to the task's current directory.
pub fn resolve_parent(
    ctx: &Ctx,
    table: &InodeTable,
    task: &dyn Task,
    root_sector: u32,
    path: &str,
) -> Result<(Directory, String)> {
    let (absolute, segments) = split_path(path)?;

    let mut current = if absolute || task.cwd().is_none() {
        Directory::open_root(ctx, table, root_sector)?
    } else {
        task.cwd().unwrap().reopen(table)
    };

    if segments.is_empty() {
        return Ok((current, String::new()));
    }

    let (last, rest) = segments.split_last().expect("checked non-empty above");
    for seg in rest {
        current = step(ctx, table, current, seg)?;
    }
    Ok((current, last.clone()))
}

/// An open file or directory handle, tagged by kind so callers never have
/// to guess what a bare inode pointer refers to.
pub enum Handle {
    /// A file handle with its own seek position.
    File(FileHandle),
    /// A directory handle with its own readdir cursor.
    Dir(Directory),
}

impl Handle {
    /// Whether this handle refers to a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, Handle::Dir(_))
    }

    /// The sector hosting this handle's inode — doubles as its inode
    /// number.
    pub fn inumber(&self) -> u32 {
        match self {
            Handle::File(f) => f.sector(),
            Handle::Dir(d) => d.sector(),
        }
    }

    /// Close this handle.
    pub fn close(self, ctx: &Ctx, table: &InodeTable) -> Result<()> {
        match self {
            Handle::File(f) => f.close(ctx, table),
            Handle::Dir(d) => d.close(ctx, table),
        }
    }
}

/// An open regular file: an inode plus this handle's own seek position.
pub struct FileHandle {
    inode: Arc<InodeHandle>,
    position: Mutex<u64>,
}

impl FileHandle {
    fn new(inode: Arc<InodeHandle>) -> FileHandle {
        FileHandle {
            inode,
            position: Mutex::new(0),
        }
    }

    /// Read into `buf` starting at the current position, advancing it by
    /// the number of bytes actually read.
    pub fn read(&self, ctx: &Ctx, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.position.lock().unwrap();
        let n = self.inode.read_at(ctx, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Write `data` starting at the current position, extending the file
    /// if needed, and advancing the position by the number of bytes
    /// actually written.
    pub fn write(&self, ctx: &Ctx, data: &[u8]) -> Result<usize> {
        let mut pos = self.position.lock().unwrap();
        let n = self.inode.write_at(ctx, data, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Move this handle's position to `pos`, independent of the file's
    /// current length.
    pub fn seek(&self, pos: u64) {
        *self.position.lock().unwrap() = pos;
    }

    /// This handle's current position.
    pub fn tell(&self) -> u64 {
        *self.position.lock().unwrap()
    }

    /// Current file length in bytes.
    pub fn length(&self) -> u64 {
        self.inode.length()
    }

    /// Deny further writers on the underlying inode.
    pub fn deny_write(&self) {
        self.inode.deny_write();
    }

    /// Lift a previously asserted deny-write.
    pub fn allow_write(&self) {
        self.inode.allow_write();
    }

    /// Sector hosting this file's inode.
    pub fn sector(&self) -> u32 {
        self.inode.sector
    }

    /// Close this handle.
    pub fn close(self, ctx: &Ctx, table: &InodeTable) -> Result<()> {
        table.close(ctx, self.inode)
    }
}

/// Resolve `path` all the way to a final handle, applying `filesys_open`'s
/// special cases for `.`, `..`, and an empty trailing basename.
pub fn resolve(
    ctx: &Ctx,
    table: &InodeTable,
    task: &dyn Task,
    root_sector: u32,
    path: &str,
) -> Result<Handle> {
    let (parent, basename) = resolve_parent(ctx, table, task, root_sector, path)?;

    if basename == "." || basename.is_empty() {
        return Ok(Handle::Dir(parent));
    }
    if basename == ".." {
        let grandparent = parent.parent(ctx, table)?;
        parent.close(ctx, table)?;
        return Ok(Handle::Dir(grandparent));
    }

    let found = parent.lookup(ctx, table, &basename);
    let result = match found {
        Ok(inode) if inode.is_directory() => {
            inode.set_parent_sector(parent.sector());
            Ok(Handle::Dir(Directory::from_handle(inode)))
        }
        Ok(inode) => Ok(Handle::File(FileHandle::new(inode))),
        Err(e) => Err(e),
    };
    parent.close(ctx, table)?;
    result
}

/// `filesys_create`: resolve the parent, reject a reserved or empty
/// basename, allocate one sector, initialize an inode or directory there,
/// and link it into the parent. The allocated sector is released if
/// anything after the allocation fails.
pub fn create(
    ctx: &Ctx,
    table: &InodeTable,
    task: &dyn Task,
    root_sector: u32,
    path: &str,
    initial_size: u64,
    is_directory: bool,
) -> Result<()> {
    let (parent, basename) = resolve_parent(ctx, table, task, root_sector, path)?;
    if basename.is_empty() || basename == "." || basename == ".." {
        parent.close(ctx, table)?;
        return Err(FsError::NameInvalid("basename is empty or reserved"));
    }
    if parent.contains(ctx, &basename)? {
        parent.close(ctx, table)?;
        return Err(FsError::Exists(basename));
    }

    let sector = ctx.alloc_sector()?;
    let outcome: Result<()> = (|| {
        if is_directory {
            Directory::create(ctx, table, sector, INITIAL_ENTRY_CAPACITY)?;
        } else {
            inode::create(ctx, sector, false)?;
            if initial_size > 0 {
                let handle = table.open(ctx, sector)?;
                let zeros = vec![0u8; initial_size as usize];
                handle.write_at(ctx, &zeros, 0)?;
                table.close(ctx, handle)?;
            }
        }
        parent.add(ctx, &basename, sector)
    })();

    match outcome {
        Ok(()) => {
            if is_directory {
                let child = table.open(ctx, sector)?;
                child.set_parent_sector(parent.sector());
                table.close(ctx, child)?;
            }
            parent.close(ctx, table)
        }
        Err(e) => {
            // The inode header (and whatever of its tree was published
            // before the failure) was already written at `sector`; tear it
            // down through the ordinary open+remove+close path rather than
            // just releasing the header, so a partially built directory's
            // data sectors aren't leaked.
            if let Ok(handle) = table.open(ctx, sector) {
                handle.mark_removed();
                let _ = table.close(ctx, handle);
            }
            parent.close(ctx, table)?;
            Err(e)
        }
    }
}

/// `filesys_open`: resolve `path` to a handle.
pub fn open(
    ctx: &Ctx,
    table: &InodeTable,
    task: &dyn Task,
    root_sector: u32,
    path: &str,
) -> Result<Handle> {
    resolve(ctx, table, task, root_sector, path)
}

/// `filesys_remove`: resolve the parent and remove `basename` from it.
pub fn remove(
    ctx: &Ctx,
    table: &InodeTable,
    task: &dyn Task,
    root_sector: u32,
    path: &str,
) -> Result<()> {
    let (parent, basename) = resolve_parent(ctx, table, task, root_sector, path)?;
    let result = parent.remove(ctx, table, &basename);
    parent.close(ctx, table)?;
    result
}

/// `change_directory`: resolve `path` like `open`, but rebind the task's
/// working directory instead of returning a handle. Fails, without
/// changing the working directory, if `path` does not name a directory.
/// Closes whatever directory was previously bound.
pub fn chdir(
    ctx: &Ctx,
    table: &InodeTable,
    task: &mut dyn Task,
    root_sector: u32,
    path: &str,
) -> Result<()> {
    let handle = resolve(ctx, table, task, root_sector, path)?;
    match handle {
        Handle::Dir(dir) => {
            if let Some(old) = task.set_cwd(dir) {
                old.close(ctx, table)?;
            }
            Ok(())
        }
        Handle::File(f) => {
            f.close(ctx, table)?;
            Err(FsError::NotFound("chdir target is not a directory"))
        }
    }
}

/// `mkdir`: `create` with `is_directory = true` and no initial size.
pub fn mkdir(
    ctx: &Ctx,
    table: &InodeTable,
    task: &dyn Task,
    root_sector: u32,
    path: &str,
) -> Result<()> {
    create(ctx, table, task, root_sector, path, 0, true)
}
