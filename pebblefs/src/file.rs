//! File objects: a position cursor over an open inode.

use pebble_fs_types::SectorNo;

use crate::{error::Error, inode::InodeHandle};

/// An opener's view of a file (or directory inode), as handed to the
/// syscall layer's descriptor table.
pub struct File {
    handle: InodeHandle,
    pos: usize,
    denied_write: bool,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").finish_non_exhaustive()
    }
}

impl File {
    pub(crate) fn new(handle: InodeHandle) -> Self {
        Self {
            handle,
            pos: 0,
            denied_write: false,
        }
    }

    /// The underlying inode's identity.
    #[must_use]
    pub fn inumber(&self) -> SectorNo {
        self.handle.inumber()
    }

    /// Current file length in bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        self.handle.length()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.handle.is_dir()
    }

    /// Reads from the cursor, clamped to end of file; `Ok(0)` at EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let remaining = self.handle.length().saturating_sub(self.pos);
        let want = buf.len().min(remaining);
        if want == 0 {
            return Ok(0);
        }
        let read = self.handle.read_at(&mut buf[..want], self.pos)?;
        self.pos += read;
        Ok(read)
    }

    /// Positioned read with the inode layer's strict bounds: a range past
    /// end of file is an error, not a short read.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, Error> {
        self.handle.read_at(buf, offset)
    }

    /// Writes at the cursor, growing the file as needed. Returns `Ok(0)`
    /// while writes are denied.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let written = self.handle.write_at(buf, self.pos)?;
        self.pos += written;
        Ok(written)
    }

    /// Positioned write; does not move the cursor.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, Error> {
        self.handle.write_at(buf, offset)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[must_use]
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Blocks writes by any opener until the matching
    /// [`allow_write`](Self::allow_write) or this object is dropped.
    /// Idempotent per file object.
    pub fn deny_write(&mut self) {
        if !self.denied_write {
            self.denied_write = true;
            self.handle.deny_write();
        }
    }

    /// Releases this object's write denial, if any.
    pub fn allow_write(&mut self) {
        if self.denied_write {
            self.denied_write = false;
            self.handle.allow_write();
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.denied_write {
            self.handle.allow_write();
        }
    }
}
