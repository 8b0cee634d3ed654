//! Free-sector bitmap.
//!
//! One bit per device sector, set while the sector is in use. The map is
//! persisted as the file at [`FREE_MAP_SECTOR`]: loaded at mount, stored at
//! format and shutdown. In between it lives purely in memory.

use std::sync::Mutex;

use pebble_fs_types::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR, SectorNo};

pub(crate) struct FreeMap {
    inner: Mutex<Bitmap>,
}

struct Bitmap {
    bits: Vec<u8>,
    sectors: u32,
}

impl Bitmap {
    fn bit(&self, n: u32) -> bool {
        self.bits[n as usize / 8] & (1 << (n % 8)) != 0
    }

    fn mark(&mut self, n: u32) {
        self.bits[n as usize / 8] |= 1 << (n % 8);
    }

    fn clear(&mut self, n: u32) {
        self.bits[n as usize / 8] &= !(1 << (n % 8));
    }
}

impl FreeMap {
    /// A map for a device of `sectors` sectors, with the two reserved
    /// sectors (free-map inode, root directory inode) already taken.
    pub(crate) fn new(sectors: u32) -> Self {
        let mut bitmap = Bitmap {
            bits: vec![0; (sectors as usize).div_ceil(8)],
            sectors,
        };
        bitmap.mark(FREE_MAP_SECTOR.value());
        bitmap.mark(ROOT_DIR_SECTOR.value());
        Self {
            inner: Mutex::new(bitmap),
        }
    }

    /// Length of the backing file, in bytes.
    pub(crate) fn file_len(&self) -> usize {
        self.inner.lock().unwrap().bits.len()
    }

    /// Takes `cnt` consecutive free sectors, returning the first.
    pub(crate) fn allocate(&self, cnt: u32) -> Option<SectorNo> {
        assert!(cnt > 0);
        let mut bitmap = self.inner.lock().unwrap();
        let Some(start) = (0..bitmap.sectors.saturating_sub(cnt - 1))
            .find(|&start| (start..start + cnt).all(|n| !bitmap.bit(n)))
        else {
            log::warn!("out of sectors");
            return None;
        };
        for n in start..start + cnt {
            bitmap.mark(n);
        }
        Some(SectorNo::new(start))
    }

    /// Returns `cnt` consecutive sectors starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if any of them is already free.
    pub(crate) fn release(&self, start: SectorNo, cnt: u32) {
        let mut bitmap = self.inner.lock().unwrap();
        for n in start.value()..start.value() + cnt {
            assert!(bitmap.bit(n), "releasing free sector {n}");
            bitmap.clear(n);
        }
    }

    /// Replaces the map with the contents of the backing file.
    pub(crate) fn load_bytes(&self, bytes: &[u8]) {
        let mut bitmap = self.inner.lock().unwrap();
        let len = bytes.len().min(bitmap.bits.len());
        bitmap.bits[..len].copy_from_slice(&bytes[..len]);
    }

    /// Snapshots the map for the backing file.
    pub(crate) fn store_bytes(&self) -> Vec<u8> {
        self.inner.lock().unwrap().bits.clone()
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> u32 {
        let bitmap = self.inner.lock().unwrap();
        (0..bitmap.sectors).filter(|&n| !bitmap.bit(n)).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_sectors_start_taken() {
        let map = FreeMap::new(16);
        assert_eq!(map.free_count(), 14);
        let first = map.allocate(1).unwrap();
        assert_eq!(first, SectorNo::new(2));
    }

    #[test]
    fn allocate_release_round_trips() {
        let map = FreeMap::new(16);
        let a = map.allocate(3).unwrap();
        assert_eq!(map.free_count(), 11);
        map.release(a, 3);
        assert_eq!(map.free_count(), 14);
    }

    #[test]
    fn exhaustion_reports_failure() {
        let map = FreeMap::new(8);
        for _ in 0..6 {
            map.allocate(1).unwrap();
        }
        assert!(map.allocate(1).is_none());
    }

    #[test]
    fn runs_are_consecutive() {
        let map = FreeMap::new(32);
        let a = map.allocate(1).unwrap();
        let b = map.allocate(4).unwrap();
        assert_eq!(b.value(), a.value() + 1);
        map.release(a, 1);
        // A run no longer fits before `b`, so it lands after it.
        let c = map.allocate(2).unwrap();
        assert_eq!(c.value(), b.value() + 4);
    }

    #[test]
    fn persistence_round_trips() {
        let map = FreeMap::new(64);
        map.allocate(5).unwrap();
        let stored = map.store_bytes();

        let reloaded = FreeMap::new(64);
        reloaded.load_bytes(&stored);
        assert_eq!(map.free_count(), reloaded.free_count());
    }

    #[test]
    #[should_panic]
    fn double_release_is_a_programming_error() {
        let map = FreeMap::new(16);
        let a = map.allocate(1).unwrap();
        map.release(a, 1);
        map.release(a, 1);
    }
}
