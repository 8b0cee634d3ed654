//! Block devices and role discovery.
//!
//! The file system does not care what backs its sectors; it asks the
//! [`DeviceSet`] for the device playing [`Role::FileSys`] and talks to it
//! through the cache from then on.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use bufcache::{BufCache, SectorDevice};
use pebble_fs_types::SECTOR_SIZE;

/// Shared handle to a sector device.
pub type DynDevice = Arc<dyn SectorDevice<SECTOR_SIZE> + Send + Sync>;

pub(crate) type Cache = BufCache<DynDevice, SECTOR_SIZE>;

/// What a registered device is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Holds the file system.
    FileSys,
    /// Spare device, unused by the core.
    Scratch,
}

/// Registry mapping roles to devices, filled in by the embedder at boot.
#[derive(Default)]
pub struct DeviceSet {
    devices: HashMap<Role, DynDevice>,
}

impl DeviceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `device` to `role`, replacing any previous binding.
    pub fn register(&mut self, role: Role, device: DynDevice) {
        self.devices.insert(role, device);
    }

    /// Looks up the device playing `role`.
    #[must_use]
    pub fn by_role(&self, role: Role) -> Option<DynDevice> {
        self.devices.get(&role).map(Arc::clone)
    }
}

/// An in-memory disk with I/O counters, for tests and demos.
///
/// The counters let callers observe cache effectiveness: every call that
/// reaches the device bumps one of them.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    /// A zero-filled disk of `sector_count` sectors.
    #[must_use]
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sector_count as usize]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of sector reads that reached the device.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of sector writes that reached the device.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SectorDevice<SECTOR_SIZE> for MemDisk {
    fn read_sector(&self, sector: u32, data: &mut [u8; SECTOR_SIZE]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        data.copy_from_slice(&self.sectors.lock().unwrap()[sector as usize]);
    }

    fn write_sector(&self, sector: u32, data: &[u8; SECTOR_SIZE]) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.sectors.lock().unwrap()[sector as usize].copy_from_slice(data);
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_resolve_to_registered_devices() {
        let mut devices = DeviceSet::new();
        assert!(devices.by_role(Role::FileSys).is_none());
        let disk = Arc::new(MemDisk::new(8));
        devices.register(Role::FileSys, disk);
        assert!(devices.by_role(Role::FileSys).is_some());
        assert!(devices.by_role(Role::Scratch).is_none());
    }

    #[test]
    fn mem_disk_counts_io() {
        let disk = MemDisk::new(4);
        let mut buf = [0; SECTOR_SIZE];
        disk.read_sector(0, &mut buf);
        buf[0] = 1;
        disk.write_sector(3, &buf);
        disk.read_sector(3, &mut buf);
        assert_eq!(disk.read_count(), 2);
        assert_eq!(disk.write_count(), 1);
        assert_eq!(buf[0], 1);
        assert_eq!(disk.sector_count(), 4);
    }
}
