//! Inodes: the open-inode table and per-opener handles.
//!
//! An inode describes a single unnamed file. Its on-disk form
//! ([`DiskInode`], exactly one sector) holds the length, the directory flag,
//! and the three-tier sector index; the inode's own sector number doubles as
//! its identity (the "inumber").
//!
//! Openers share one in-memory [`Inode`] per sector, found through the
//! open-inode table. The table entry carries what disk does not: the open
//! count, the removed flag, the extension and writer bookkeeping, and a
//! cached copy of the on-disk image. The image is loaded when the first
//! opener arrives and written back when the last one leaves; if the inode
//! was removed in between, its sectors are returned to the free map instead.
//!
//! An [`InodeHandle`] is one opener's reference: cloning it reopens the
//! inode, dropping it closes. While any handle exists the inode stays in the
//! table, so a sector never has two live in-memory inodes.
//!
//! Growth is coordinated by the `extending` flag: the extending writer
//! installs new sectors with the state mutex released, then commits the new
//! image and length in one step. Readers and other writers wait out the flag
//! before they trust the length, so no one observes a half-installed index.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use dataview::PodMethods as _;
use pebble_fs_types::{DiskInode, MAX_FILE_BYTES, SectorNo};

use crate::{error::Error, fs::FsInner};

pub(crate) mod content;

/// In-memory inode, shared by every opener and owned by the table.
pub(crate) struct Inode {
    sector: SectorNo,
    /// Serialises directory operations over this inode (see `dir`).
    dir_lock: Mutex<()>,
    state: Mutex<InodeState>,
    /// Signalled when a length-extending allocation finishes.
    not_extending: Condvar,
    /// Signalled when the last active writer leaves.
    no_writers: Condvar,
}

struct InodeState {
    open_count: u32,
    removed: bool,
    /// A length-extending allocation is in progress.
    extending: bool,
    deny_write_count: u32,
    /// Writers currently between the deny-write check and completion.
    active_writers: u32,
    /// Cached copy of the on-disk image.
    disk: DiskInode,
}

pub(crate) struct InodeTable {
    map: Mutex<HashMap<SectorNo, Arc<Inode>>>,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

/// One opener's reference to an inode. Cloning reopens; dropping closes.
pub(crate) struct InodeHandle {
    fs: Arc<FsInner>,
    node: Arc<Inode>,
}

/// Opens the inode at `sector`, loading its image on first open.
pub(crate) fn open(fs: &Arc<FsInner>, sector: SectorNo) -> InodeHandle {
    let mut map = fs.inodes.map.lock().unwrap();
    if let Some(node) = map.get(&sector) {
        node.state.lock().unwrap().open_count += 1;
        return InodeHandle {
            fs: Arc::clone(fs),
            node: Arc::clone(node),
        };
    }

    let node = Arc::new(Inode {
        sector,
        dir_lock: Mutex::new(()),
        state: Mutex::new(InodeState {
            open_count: 1,
            removed: false,
            extending: false,
            deny_write_count: 0,
            active_writers: 0,
            disk: DiskInode::zeroed(),
        }),
        not_extending: Condvar::new(),
        no_writers: Condvar::new(),
    });

    // Hold the state mutex across publication so a concurrent opener of the
    // same sector blocks until the image is loaded.
    let mut state = node.state.lock().unwrap();
    map.insert(sector, Arc::clone(&node));
    drop(map);
    state.disk = fs.cache.read_pod::<DiskInode>(sector.value());
    if !state.disk.is_valid() {
        log::warn!("inode sector {sector} has no magic");
    }
    drop(state);

    InodeHandle {
        fs: Arc::clone(fs),
        node,
    }
}

/// Writes a fresh inode image at `sector` with room for `length` bytes.
/// The directory flag is stamped afterwards through
/// [`InodeHandle::set_is_dir`].
///
/// On allocation failure the caller still owns the sector reservation;
/// sectors granted before the failure are not returned.
pub(crate) fn create(fs: &FsInner, sector: SectorNo, length: usize) -> Result<(), Error> {
    let mut disk = DiskInode::new(false);
    content::extend(&fs.cache, &fs.free_map, &mut disk, length)?;
    disk.set_length(length);
    fs.cache.write_pod(sector.value(), &disk);
    Ok(())
}

impl Clone for InodeHandle {
    fn clone(&self) -> Self {
        self.node.state.lock().unwrap().open_count += 1;
        Self {
            fs: Arc::clone(&self.fs),
            node: Arc::clone(&self.node),
        }
    }
}

impl Drop for InodeHandle {
    fn drop(&mut self) {
        let mut map = self.fs.inodes.map.lock().unwrap();
        let mut state = self.node.state.lock().unwrap();
        state.open_count -= 1;
        if state.open_count > 0 {
            return;
        }

        // Last opener: retire the table entry, then either free the file or
        // persist the (possibly extended) image. Both can touch the device,
        // so the table lock is released first.
        map.remove(&self.node.sector);
        let removed = state.removed;
        let disk = state.disk.clone();
        drop(state);
        drop(map);

        if removed {
            content::release(&self.fs.cache, &self.fs.free_map, &disk, self.node.sector);
        } else {
            self.fs.cache.write_pod(self.node.sector.value(), &disk);
        }
    }
}

impl InodeHandle {
    pub(crate) fn fs(&self) -> &Arc<FsInner> {
        &self.fs
    }

    pub(crate) fn dir_lock(&self) -> &Mutex<()> {
        &self.node.dir_lock
    }

    pub(crate) fn inumber(&self) -> SectorNo {
        self.node.sector
    }

    pub(crate) fn length(&self) -> usize {
        self.node.state.lock().unwrap().disk.length()
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.node.state.lock().unwrap().disk.is_dir()
    }

    /// Stamps the directory flag and persists the image.
    pub(crate) fn set_is_dir(&self, is_dir: bool) {
        let mut state = self.node.state.lock().unwrap();
        state.disk.set_is_dir(is_dir);
        self.fs.cache.write_pod(self.node.sector.value(), &state.disk);
    }

    /// Marks the inode for deallocation at last close. The file stays usable
    /// for everyone who already has it open.
    pub(crate) fn set_removed(&self) {
        self.node.state.lock().unwrap().removed = true;
    }

    /// Blocks new writes. Waits for writers already past their deny-write
    /// check to finish first. At most one call per opener.
    pub(crate) fn deny_write(&self) {
        let mut state = self.node.state.lock().unwrap();
        while state.active_writers > 0 {
            state = self.node.no_writers.wait(state).unwrap();
        }
        state.deny_write_count += 1;
        assert!(state.deny_write_count <= state.open_count);
    }

    /// Undoes one [`deny_write`](Self::deny_write).
    pub(crate) fn allow_write(&self) {
        let mut state = self.node.state.lock().unwrap();
        assert!(state.deny_write_count > 0);
        state.deny_write_count -= 1;
    }

    /// Reads `buf.len()` bytes at `offset`.
    ///
    /// A range reaching past end of file is refused outright; the syscall
    /// layer reports that as -1.
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, Error> {
        let disk = {
            let mut state = self.node.state.lock().unwrap();
            while state.extending {
                state = self.node.not_extending.wait(state).unwrap();
            }
            let end = offset
                .checked_add(buf.len())
                .ok_or(Error::OffsetOutOfRange)?;
            if end > state.disk.length() {
                return Err(Error::OffsetOutOfRange);
            }
            state.disk.clone()
        };
        // Sectors mapped below `length` never move while the inode is open,
        // so the snapshot stays accurate without the mutex.
        Ok(content::read_chunks(&self.fs.cache, &disk, buf, offset))
    }

    /// Writes `buf.len()` bytes at `offset`, extending the file as needed.
    ///
    /// Returns `Ok(0)` without touching the file while writes are denied.
    pub(crate) fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, Error> {
        let end = offset.checked_add(buf.len()).ok_or(Error::FileTooLarge)?;
        if end > MAX_FILE_BYTES {
            return Err(Error::FileTooLarge);
        }

        let disk = {
            let mut state = self.node.state.lock().unwrap();
            if state.deny_write_count > 0 {
                return Ok(0);
            }
            state.active_writers += 1;
            while state.extending {
                state = self.node.not_extending.wait(state).unwrap();
            }
            if end > state.disk.length() {
                match self.extend_locked(state, end) {
                    Ok(disk) => disk,
                    Err(err) => {
                        self.writer_done();
                        return Err(err);
                    }
                }
            } else {
                state.disk.clone()
            }
        };

        let written = content::write_chunks(&self.fs.cache, &disk, buf, offset);
        self.writer_done();
        Ok(written)
    }

    fn writer_done(&self) {
        let mut state = self.node.state.lock().unwrap();
        state.active_writers -= 1;
        if state.active_writers == 0 {
            self.node.no_writers.notify_all();
        }
    }

    /// Grows the file to `new_len` bytes. Entered with the state mutex held;
    /// the allocation itself runs on a private copy of the image with the
    /// mutex released, and the commit republishes image and length together.
    fn extend_locked(
        &self,
        mut state: MutexGuard<'_, InodeState>,
        new_len: usize,
    ) -> Result<DiskInode, Error> {
        state.extending = true;
        let mut disk = state.disk.clone();
        drop(state);

        let res = content::extend(&self.fs.cache, &self.fs.free_map, &mut disk, new_len);

        let mut state = self.node.state.lock().unwrap();
        let out = match res {
            Ok(()) => {
                disk.set_length(new_len);
                state.disk = disk.clone();
                Ok(disk)
            }
            // Sectors granted before the failure leak; the old image and
            // length stay in force.
            Err(err) => Err(err),
        };
        state.extending = false;
        self.node.not_extending.notify_all();
        out
    }
}
