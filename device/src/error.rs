//! Error type for the block device layer.
//!
//! This is the bottom of the error stack: every other crate in the
//! workspace wraps `DeviceError` with `#[from]` rather than re-deriving its
//! own I/O error handling.

use std::io;
use thiserror::Error;

/// Errors raised by [`crate::controller::Device`] and the raw
/// [`crate::types::Buffer`]/[`crate::types::Block`] helpers.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Wraps a `std::io::Error` encountered while creating, opening or
    /// memory-mapping the backing file.
    #[error("I/O error in the device layer")]
    Io(#[from] io::Error),

    /// Wraps a `bincode::Error` encountered while (de)serializing a record
    /// into a sector buffer.
    #[error("serialization error in the device layer")]
    Serialize(#[from] bincode::Error),

    /// Invalid input to the device itself (bad sector index, wrong image
    /// size, path already/not-yet existing).
    #[error("invalid device input: {0}")]
    Invalid(&'static str),

    /// Invalid input to a `Buffer`/`Block` (read or write past its bounds).
    #[error("invalid buffer input: {0}")]
    BufferBounds(&'static str),
}

/// Shorthand `Result` alias using [`DeviceError`].
pub type Result<T> = std::result::Result<T, DeviceError>;
