//! pebblefs - a teaching-grade on-disk file system.
//!
//! Three layers, leaves first:
//!
//! * Sector cache: a bounded write-back cache mediating all device I/O
//!   (the `bufcache` crate).
//! * Inodes: a multi-level on-disk index per file, an in-memory table of
//!   open inodes, growth under concurrent readers and writers, and
//!   deny-write exclusion.
//! * Directories and names: directories are inode-backed files of fixed-size
//!   entries; slash-separated paths resolve against a per-process directory
//!   context.
//!
//! [`Filesys`] is the facade the syscall layer talks to; [`File`] and
//! [`Dir`] are the objects it hands out. The free-sector bitmap lives in a
//! file at sector 0, the root directory at sector 1.

pub mod device;
mod dir;
mod error;
mod file;
mod free_map;
mod fs;
mod inode;
mod path;

pub use pebble_fs_types::{
    MAX_FILE_BYTES, NAME_MAX, ROOT_DIR_SECTOR, SECTOR_SIZE, SectorNo,
};

pub use self::{dir::Dir, error::Error, file::File, fs::Filesys, path::DirContext};

/// Number of slots in the sector cache.
pub const CACHE_SLOTS: usize = 64;

/// Entry capacity of a freshly formatted root directory.
pub const ROOT_DIR_ENTRIES: usize = 16;
