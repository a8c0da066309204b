//! Error type for the filesystem core.
//!
//! Every recoverable condition spec'd in the design (no space, not found,
//! not empty, in use, name collision, invalid name, bad range, deny-write)
//! gets its own variant so callers can match on it instead of string
//! sniffing. Nothing in this crate panics on a recoverable condition; the
//! one exception is a missing device at mount time, which the design
//! explicitly calls out as fatal.

use fs_device::error::DeviceError;
use thiserror::Error;

/// Errors produced by the filesystem core.
#[derive(Error, Debug)]
pub enum FsError {
    /// Propagated from the block device layer.
    #[error("device error")]
    Device(#[from] DeviceError),

    /// A directory-entry record failed to (de)serialize. Distinct from
    /// [`FsError::Device`] since this crate serializes directory entries
    /// directly, without going through a `Block`.
    #[error("directory entry serialization error")]
    Serialize(#[from] bincode::Error),

    /// The free map has no run of sectors satisfying a request.
    #[error("no free space for {0} sector(s)")]
    NoSpace(u64),

    /// A path component, directory entry, or handle could not be found.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// A directory removal was attempted on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// A directory removal was attempted while another task has it open.
    #[error("directory in use")]
    InUse,

    /// A directory entry with this name already exists.
    #[error("name already exists: {0}")]
    Exists(String),

    /// A name was empty, reserved (`.`/`..`), or exceeded `NAME_MAX`.
    #[error("invalid name: {0}")]
    NameInvalid(&'static str),

    /// A negative size/offset, or an index beyond the maximum file size.
    #[error("offset or size out of range")]
    BadRange,

    /// A write was attempted while the inode's writes are denied.
    #[error("writes are denied on this inode")]
    DenyWrite,

    /// A path string was not well-formed (empty, malformed separators).
    #[error("invalid path: {0}")]
    InvalidPath(&'static str),

    /// The underlying device could not be found at mount time. Fatal: the
    /// design calls for this to be unrecoverable, as there is nothing
    /// sensible left to mount.
    #[error("no filesystem device found")]
    DeviceAbsent,
}

/// Shorthand `Result` alias using [`FsError`].
pub type Result<T> = std::result::Result<T, FsError>;
