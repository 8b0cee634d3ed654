//! Directories.
//!
//! A directory is an ordinary inode-backed file holding an array of
//! fixed-size entries; only the in-use flag distinguishes a live binding
//! from a free slot. All mutations and lookups over one directory serialise
//! on a mutex shared by every handle to that directory's inode, so two
//! concurrent `add`s cannot claim the same free slot.

use arrayvec::ArrayString;
use dataview::PodMethods as _;
use pebble_fs_types::{DIR_ENTRY_SIZE, DirEntryRepr, NAME_MAX, SectorNo};

use crate::{
    error::Error,
    inode::{self, InodeHandle},
};

/// An open directory: an inode handle plus a cursor for enumeration.
pub struct Dir {
    handle: InodeHandle,
    pos: usize,
}

impl std::fmt::Debug for Dir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dir").finish_non_exhaustive()
    }
}

impl Dir {
    pub(crate) fn from_handle(handle: InodeHandle) -> Result<Self, Error> {
        if !handle.is_dir() {
            return Err(Error::NotADirectory);
        }
        Ok(Self { handle, pos: 0 })
    }

    pub(crate) fn into_handle(self) -> InodeHandle {
        self.handle
    }

    /// The directory's inumber.
    #[must_use]
    pub fn inumber(&self) -> SectorNo {
        self.handle.inumber()
    }

    fn read_entry(&self, offset: usize) -> Option<DirEntryRepr> {
        let mut entry = DirEntryRepr::zeroed();
        match self.handle.read_at(entry.as_bytes_mut(), offset) {
            Ok(n) if n == DIR_ENTRY_SIZE => Some(entry),
            _ => None,
        }
    }

    /// Scans for a live entry named `name`. Caller holds the directory lock.
    fn find(&self, name: &str) -> Option<(DirEntryRepr, usize)> {
        (0..self.handle.length())
            .step_by(DIR_ENTRY_SIZE)
            .find_map(|offset| {
                let entry = self.read_entry(offset)?;
                entry.matches(name).then_some((entry, offset))
            })
    }

    /// Looks up `name`, returning the sector of its inode.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SectorNo> {
        let _guard = self.handle.dir_lock().lock().unwrap();
        self.find(name).map(|(entry, _)| entry.inode_sector())
    }

    /// Binds `name` to the inode at `sector`, taking the first free slot or
    /// growing the directory by one entry.
    pub fn add(&self, name: &str, sector: SectorNo) -> Result<(), Error> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(Error::BadName);
        }
        let _guard = self.handle.dir_lock().lock().unwrap();
        if self.find(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        let length = self.handle.length();
        assert_eq!(length % DIR_ENTRY_SIZE, 0);
        let offset = (0..length)
            .step_by(DIR_ENTRY_SIZE)
            .find(|&offset| self.read_entry(offset).is_some_and(|e| !e.in_use()))
            .unwrap_or(length);

        let entry = DirEntryRepr::new(sector, name);
        match self.handle.write_at(entry.as_bytes(), offset) {
            Ok(n) if n == DIR_ENTRY_SIZE => Ok(()),
            Ok(_) => Err(Error::NoSpace),
            Err(err) => Err(err),
        }
    }

    /// Unbinds `name` and marks its inode removed; the inode's sectors are
    /// returned when the last opener closes it.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let guard = self.handle.dir_lock().lock().unwrap();
        let (mut entry, offset) = self.find(name).ok_or(Error::NotFound)?;

        let target = inode::open(self.handle.fs(), entry.inode_sector());
        entry.clear();
        let erased = match self.handle.write_at(entry.as_bytes(), offset) {
            Ok(n) if n == DIR_ENTRY_SIZE => Ok(()),
            Ok(_) => Err(Error::NoSpace),
            Err(err) => Err(err),
        };
        if erased.is_ok() {
            target.set_removed();
        }
        drop(guard);
        // Closing the target may deallocate the whole file; that device I/O
        // stays outside the directory lock.
        drop(target);
        erased
    }

    /// Streams the next live entry name, skipping free slots.
    pub fn read_next(&mut self) -> Option<ArrayString<NAME_MAX>> {
        loop {
            let entry = self.read_entry(self.pos)?;
            self.pos += DIR_ENTRY_SIZE;
            if entry.in_use() {
                return Some(ArrayString::from(entry.name()).unwrap_or_default());
            }
        }
    }
}
