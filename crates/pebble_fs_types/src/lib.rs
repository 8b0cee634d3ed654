//! On-disk data layout for pebblefs.
//!
//! The layout:
//!
//! | sector           | content                 | type                  |
//! |------------------|-------------------------|-----------------------|
//! | 0                | free-map file inode     | [`DiskInode`]         |
//! | 1                | root directory inode    | [`DiskInode`]         |
//! | everything else  | inodes, pointer blocks, | [`DiskInode`],        |
//! |                  | file data               | [`IndirectBlock`], …  |
//!
//! Every inode occupies exactly one sector. A file's data sectors are reached
//! through the inode's direct pointers, one indirect block, and one
//! double-indirect block. Directory files are arrays of [`DirEntryRepr`]
//! records. Numeric fields are natural-width little-endian integers; a zero
//! sector pointer means "unallocated" (sector 0 holds the free-map inode and
//! is never a data sector).

use core::{fmt, str};

use dataview::{Pod, PodMethods as _};
use memchr::memchr;

/// Sector size of the backing device in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of data sectors referenced directly by an inode.
pub const NUM_DIRECT: usize = 123;

/// Number of sector pointers in one indirect block.
pub const PTRS_PER_BLOCK: usize = SECTOR_SIZE / size_of::<u32>();

/// Largest supported file, in sectors.
pub const MAX_FILE_SECTORS: usize = NUM_DIRECT + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK;

/// Largest supported file, in bytes.
pub const MAX_FILE_BYTES: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Trailing identification constant of every inode sector ("INOD").
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Longest directory entry name, in bytes.
pub const NAME_MAX: usize = 14;

/// Size of one directory entry record.
pub const DIR_ENTRY_SIZE: usize = 20;

/// Sector of the free-map file inode.
pub const FREE_MAP_SECTOR: SectorNo = SectorNo::new(0);

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: SectorNo = SectorNo::new(1);

/// Returns the number of sectors needed to hold `len` bytes.
#[must_use]
pub const fn bytes_to_sectors(len: usize) -> usize {
    len.div_ceil(SECTOR_SIZE)
}

/// A device sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct SectorNo(u32);

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SectorNo {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

fn decode_ptr(raw: u32) -> Option<SectorNo> {
    if raw == 0 { None } else { Some(SectorNo(raw)) }
}

/// On-disk inode. Exactly one sector.
#[derive(Clone, Pod)]
#[repr(C)]
pub struct DiskInode {
    /// File length in bytes.
    length: u32,
    /// 0 for a plain file, 1 for a directory.
    is_dir: u32,
    direct: [u32; NUM_DIRECT],
    indirect: u32,
    double_indirect: u32,
    /// [`INODE_MAGIC`].
    magic: u32,
}
const _: () = assert!(size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    /// A fresh zero-length inode carrying the magic tag.
    #[must_use]
    pub fn new(is_dir: bool) -> Self {
        let mut inode = Self::zeroed();
        inode.magic = INODE_MAGIC;
        inode.is_dir = u32::from(is_dir);
        inode
    }

    #[must_use]
    pub fn length(&self) -> usize {
        self.length as usize
    }

    pub fn set_length(&mut self, length: usize) {
        assert!(length <= MAX_FILE_BYTES);
        self.length = u32::try_from(length).unwrap();
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn set_is_dir(&mut self, is_dir: bool) {
        self.is_dir = u32::from(is_dir);
    }

    /// Whether the sector carries the inode magic tag.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[must_use]
    pub fn direct(&self, i: usize) -> Option<SectorNo> {
        decode_ptr(self.direct[i])
    }

    pub fn set_direct(&mut self, i: usize, sector: SectorNo) {
        assert_eq!(self.direct[i], 0);
        assert_ne!(sector.value(), 0);
        self.direct[i] = sector.value();
    }

    #[must_use]
    pub fn indirect(&self) -> Option<SectorNo> {
        decode_ptr(self.indirect)
    }

    pub fn set_indirect(&mut self, sector: SectorNo) {
        assert_eq!(self.indirect, 0);
        self.indirect = sector.value();
    }

    #[must_use]
    pub fn double_indirect(&self) -> Option<SectorNo> {
        decode_ptr(self.double_indirect)
    }

    pub fn set_double_indirect(&mut self, sector: SectorNo) {
        assert_eq!(self.double_indirect, 0);
        self.double_indirect = sector.value();
    }
}

/// A sector full of sector pointers, used for both the indirect and the
/// double-indirect level.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([u32; PTRS_PER_BLOCK]);
const _: () = assert!(size_of::<IndirectBlock>() == SECTOR_SIZE);

impl IndirectBlock {
    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorNo> {
        decode_ptr(self.0[i])
    }

    pub fn set(&mut self, i: usize, sector: SectorNo) {
        assert_eq!(self.0[i], 0);
        assert_ne!(sector.value(), 0);
        self.0[i] = sector.value();
    }
}

/// A single directory entry: inode sector, NUL-padded name, in-use flag.
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct DirEntryRepr {
    inode_sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}
const _: () = assert!(size_of::<DirEntryRepr>() == DIR_ENTRY_SIZE);

impl DirEntryRepr {
    /// An in-use entry binding `name` to `sector`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty or longer than [`NAME_MAX`].
    #[must_use]
    pub fn new(sector: SectorNo, name: &str) -> Self {
        assert!(!name.is_empty() && name.len() <= NAME_MAX);
        let mut entry = Self::zeroed();
        entry.inode_sector = sector.value();
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.in_use = 1;
        entry
    }

    #[must_use]
    pub fn inode_sector(&self) -> SectorNo {
        SectorNo(self.inode_sector)
    }

    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    /// Frees the slot. The stale name and sector are left behind, as only
    /// the flag decides liveness.
    pub fn clear(&mut self) {
        self.in_use = 0;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        let len = memchr(0, &self.name).unwrap_or(self.name.len());
        str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Whether this entry is live and named `name`.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.in_use() && self.name() == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() {
        assert_eq!(PTRS_PER_BLOCK, 128);
        assert_eq!(MAX_FILE_SECTORS, 123 + 128 + 128 * 128);
        assert_eq!(bytes_to_sectors(0), 0);
        assert_eq!(bytes_to_sectors(1), 1);
        assert_eq!(bytes_to_sectors(SECTOR_SIZE), 1);
        assert_eq!(bytes_to_sectors(SECTOR_SIZE + 1), 2);
    }

    #[test]
    fn fresh_inode_is_tagged_and_empty() {
        let inode = DiskInode::new(true);
        assert!(inode.is_valid());
        assert!(inode.is_dir());
        assert_eq!(inode.length(), 0);
        assert_eq!(inode.direct(0), None);
        assert_eq!(inode.indirect(), None);
        assert_eq!(inode.double_indirect(), None);
    }

    #[test]
    fn pointer_encoding_round_trips() {
        let mut inode = DiskInode::new(false);
        inode.set_direct(5, SectorNo::new(42));
        assert_eq!(inode.direct(5), Some(SectorNo::new(42)));
        assert_eq!(inode.direct(6), None);

        let mut block = IndirectBlock::zeroed();
        block.set(127, SectorNo::new(7));
        assert_eq!(block.get(127), Some(SectorNo::new(7)));
        assert_eq!(block.get(0), None);
    }

    #[test]
    #[should_panic]
    fn remapping_a_pointer_is_a_programming_error() {
        let mut inode = DiskInode::new(false);
        inode.set_direct(0, SectorNo::new(3));
        inode.set_direct(0, SectorNo::new(4));
    }

    #[test]
    fn dir_entry_name_round_trips() {
        let entry = DirEntryRepr::new(SectorNo::new(9), "a");
        assert!(entry.in_use());
        assert_eq!(entry.name(), "a");
        assert_eq!(entry.inode_sector(), SectorNo::new(9));

        let longest = "abcdefghijklmn";
        assert_eq!(longest.len(), NAME_MAX);
        let entry = DirEntryRepr::new(SectorNo::new(9), longest);
        assert_eq!(entry.name(), longest);
    }

    #[test]
    fn cleared_entry_matches_nothing() {
        let mut entry = DirEntryRepr::new(SectorNo::new(9), "gone");
        assert!(entry.matches("gone"));
        entry.clear();
        assert!(!entry.matches("gone"));
        assert!(!entry.in_use());
    }

    #[test]
    #[should_panic]
    fn oversized_name_is_rejected() {
        DirEntryRepr::new(SectorNo::new(1), "abcdefghijklmno");
    }
}
