//! The file system facade.
//!
//! Path-level operations enter here; the facade splits a path into a parent
//! directory and a leaf name, then drives the inode and directory layers.
//! Everything below it reads and writes through the sector cache.

use std::sync::Arc;

use pebble_fs_types::{DIR_ENTRY_SIZE, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

use crate::{
    CACHE_SLOTS, ROOT_DIR_ENTRIES,
    device::{Cache, DeviceSet, Role},
    dir::Dir,
    error::Error,
    file::File,
    free_map::FreeMap,
    inode::{self, InodeTable},
    path::{self, DirContext},
};

pub(crate) struct FsInner {
    pub(crate) cache: Cache,
    pub(crate) free_map: FreeMap,
    pub(crate) inodes: InodeTable,
}

/// One mounted file system.
pub struct Filesys {
    pub(crate) inner: Arc<FsInner>,
}

impl Filesys {
    /// Mounts the [`Role::FileSys`] device from `devices`. With `format`
    /// true the disk is (re)initialised: a free-map file at sector 0 and an
    /// empty root directory at sector 1; otherwise the existing free map is
    /// loaded.
    pub fn new(devices: &DeviceSet, format: bool) -> Result<Self, Error> {
        let device = devices.by_role(Role::FileSys).ok_or(Error::NoDevice)?;
        let sectors = device.sector_count();
        let fs = Self {
            inner: Arc::new(FsInner {
                cache: Cache::new(device, CACHE_SLOTS),
                free_map: FreeMap::new(sectors),
                inodes: InodeTable::new(),
            }),
        };
        if format {
            fs.format()?;
        } else {
            fs.load_free_map();
        }
        Ok(fs)
    }

    fn format(&self) -> Result<(), Error> {
        log::info!("formatting file system");
        inode::create(&self.inner, FREE_MAP_SECTOR, self.inner.free_map.file_len())?;
        inode::create(&self.inner, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES * DIR_ENTRY_SIZE)?;
        inode::open(&self.inner, ROOT_DIR_SECTOR).set_is_dir(true);
        self.store_free_map();
        Ok(())
    }

    fn load_free_map(&self) {
        let handle = inode::open(&self.inner, FREE_MAP_SECTOR);
        let mut bytes = vec![0u8; self.inner.free_map.file_len().min(handle.length())];
        if handle.read_at(&mut bytes, 0).is_ok() {
            self.inner.free_map.load_bytes(&bytes);
        }
    }

    fn store_free_map(&self) {
        let bytes = self.inner.free_map.store_bytes();
        let handle = inode::open(&self.inner, FREE_MAP_SECTOR);
        if let Err(err) = handle.write_at(&bytes, 0) {
            log::warn!("storing free map failed: {err}");
        }
    }

    /// Creates a file or directory at `path` with room for `initial_size`
    /// bytes. Fails if the name is already bound in its parent.
    pub fn create(
        &self,
        ctx: &DirContext,
        path: &str,
        initial_size: usize,
        is_dir: bool,
    ) -> Result<(), Error> {
        if path.is_empty() {
            return Err(Error::BadPath);
        }
        // Directory bodies are arrays of whole entries.
        let initial_size = if is_dir {
            initial_size.next_multiple_of(DIR_ENTRY_SIZE)
        } else {
            initial_size
        };
        let (dir, leaf) = path::resolve_parent(&self.inner, ctx, path)?;
        let sector = self.inner.free_map.allocate(1).ok_or(Error::NoSpace)?;
        let result = inode::create(&self.inner, sector, initial_size).and_then(|()| {
            inode::open(&self.inner, sector).set_is_dir(is_dir);
            dir.add(leaf, sector)
        });
        if let Err(err) = result {
            // Only the inode's own reservation is returned; data sectors
            // granted to a half-created inode stay leaked.
            self.inner.free_map.release(sector, 1);
            return Err(err);
        }
        Ok(())
    }

    /// Opens the file or directory at `path`.
    pub fn open(&self, ctx: &DirContext, path: &str) -> Result<File, Error> {
        if path.is_empty() {
            return Err(Error::BadPath);
        }
        Ok(File::new(path::resolve_open(&self.inner, ctx, path)?))
    }

    /// Opens the directory at `path`, for enumeration.
    pub fn open_dir(&self, ctx: &DirContext, path: &str) -> Result<Dir, Error> {
        if path.is_empty() {
            return Err(Error::BadPath);
        }
        path::resolve_all(&self.inner, ctx, path)
    }

    /// Unbinds the leaf of `path` from its parent directory. The inode's
    /// sectors come back once its last opener closes it.
    pub fn remove(&self, ctx: &DirContext, path: &str) -> Result<(), Error> {
        if path.is_empty() || path == "/" {
            return Err(Error::BadPath);
        }
        let (dir, leaf) = path::resolve_parent(&self.inner, ctx, path)?;
        dir.remove(leaf)
    }

    /// Moves `ctx` into the directory at `path`. The previous current
    /// directory becomes the context's parent.
    pub fn chdir(&self, ctx: &mut DirContext, path: &str) -> Result<(), Error> {
        if path.is_empty() {
            return Err(Error::BadPath);
        }
        let dir = path::resolve_all(&self.inner, ctx, path)?;
        ctx.parent = ctx.cwd;
        ctx.cwd = dir.inumber();
        Ok(())
    }

    /// Writes the free map back and flushes every dirty cache slot.
    pub fn shutdown(self) {
        self.store_free_map();
        self.inner.cache.flush();
    }

    /// Test hook: flushes, then drops all cache residency.
    pub fn reset_cache(&self) {
        self.inner.cache.reset();
    }
}
