//! Sector-addressed block device abstraction.
//!
//! This crate is the "external collaborator" boundary described by the
//! filesystem core: a byte-addressable device of fixed-size sectors with
//! synchronous read/write, and nothing else. It owns no notion of inodes,
//! directories, or free space — those live in the `fs` crate.

#![deny(missing_docs)]

pub mod controller;
pub mod error;
pub mod types;

/// Size of a single sector, in bytes. Fixed for the lifetime of a device;
/// every on-disk record above this layer is designed to fit within one.
pub const SECTOR_SIZE: u64 = 512;
