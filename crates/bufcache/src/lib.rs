//! Write-back cache for sector I/O.
//!
//! The cache owns a fixed number of slots, each able to hold one device
//! sector. All reads and writes go through the resident copy; dirty slots are
//! written back when they are evicted and on [`BufCache::flush`]. Eviction is
//! least-recently-used among slots that are not currently undergoing I/O.
//!
//! A slot with `ready == false` has an I/O in flight against it; the thread
//! that cleared the flag owns the slot until it sets the flag again. Device
//! I/O is always performed with the cache mutex released, so I/O on distinct
//! slots proceeds in parallel.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use dataview::{Pod, PodMethods as _};

/// A fixed-geometry block device addressed in whole sectors.
///
/// I/O is infallible at this layer; callers validate sector numbers and
/// ranges before they reach the device.
pub trait SectorDevice<const SECTOR_SIZE: usize> {
    /// Reads one sector into `data`.
    fn read_sector(&self, sector: u32, data: &mut [u8; SECTOR_SIZE]);

    /// Writes one sector from `data`.
    fn write_sector(&self, sector: u32, data: &[u8; SECTOR_SIZE]);

    /// Returns the device capacity in sectors.
    fn sector_count(&self) -> u32;
}

impl<D, const N: usize> SectorDevice<N> for &D
where
    D: SectorDevice<N> + ?Sized,
{
    fn read_sector(&self, sector: u32, data: &mut [u8; N]) {
        (**self).read_sector(sector, data);
    }

    fn write_sector(&self, sector: u32, data: &[u8; N]) {
        (**self).write_sector(sector, data);
    }

    fn sector_count(&self) -> u32 {
        (**self).sector_count()
    }
}

impl<D, const N: usize> SectorDevice<N> for Box<D>
where
    D: SectorDevice<N> + ?Sized,
{
    fn read_sector(&self, sector: u32, data: &mut [u8; N]) {
        (**self).read_sector(sector, data);
    }

    fn write_sector(&self, sector: u32, data: &[u8; N]) {
        (**self).write_sector(sector, data);
    }

    fn sector_count(&self) -> u32 {
        (**self).sector_count()
    }
}

impl<D, const N: usize> SectorDevice<N> for Arc<D>
where
    D: SectorDevice<N> + ?Sized,
{
    fn read_sector(&self, sector: u32, data: &mut [u8; N]) {
        (**self).read_sector(sector, data);
    }

    fn write_sector(&self, sector: u32, data: &[u8; N]) {
        (**self).write_sector(sector, data);
    }

    fn sector_count(&self) -> u32 {
        (**self).sector_count()
    }
}

/// A write-back sector cache in front of a [`SectorDevice`].
pub struct BufCache<D, const SECTOR_SIZE: usize> {
    device: D,
    state: Mutex<CacheState<SECTOR_SIZE>>,
    /// One signal per slot: "this slot's in-flight I/O finished".
    slot_ready: Box<[Condvar]>,
    /// "Some slot became ready" -- woken after every I/O completion.
    any_ready: Condvar,
}

struct CacheState<const SECTOR_SIZE: usize> {
    slots: Box<[Slot<SECTOR_SIZE>]>,
    /// Slot indices ordered by recency of use; front is most recent.
    lru: VecDeque<usize>,
}

struct Slot<const SECTOR_SIZE: usize> {
    /// Which device sector this slot backs, if any.
    sector: Option<u32>,
    /// The resident copy differs from the on-device copy.
    dirty: bool,
    /// No I/O is in flight against this slot.
    ready: bool,
    data: Box<[u8; SECTOR_SIZE]>,
}

impl<D, const SECTOR_SIZE: usize> BufCache<D, SECTOR_SIZE>
where
    D: SectorDevice<SECTOR_SIZE>,
{
    /// Creates a cache of `num_slots` empty, ready, clean slots.
    ///
    /// # Panics
    ///
    /// Panics if `num_slots` is 0.
    pub fn new(device: D, num_slots: usize) -> Self {
        assert!(num_slots > 0);
        let slots = (0..num_slots)
            .map(|_| Slot {
                sector: None,
                dirty: false,
                ready: true,
                data: Box::new([0; SECTOR_SIZE]),
            })
            .collect();
        let slot_ready = (0..num_slots).map(|_| Condvar::new()).collect();
        Self {
            device,
            state: Mutex::new(CacheState {
                slots,
                lru: (0..num_slots).collect(),
            }),
            slot_ready,
            any_ready: Condvar::new(),
        }
    }

    /// Copies `dst.len()` bytes out of the cached sector, starting at
    /// `offset` within the sector.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit in one sector.
    pub fn read(&self, sector: u32, dst: &mut [u8], offset: usize) {
        assert!(offset + dst.len() <= SECTOR_SIZE);
        let state = self.state.lock().unwrap();
        let (state, slot) = self.access(state, sector);
        dst.copy_from_slice(&state.slots[slot].data[offset..offset + dst.len()]);
    }

    /// Copies `src.len()` bytes into the cached sector, starting at `offset`
    /// within the sector, and marks the slot dirty. A zero-length write
    /// faults the sector in but leaves the slot clean.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit in one sector.
    pub fn write(&self, sector: u32, src: &[u8], offset: usize) {
        assert!(offset + src.len() <= SECTOR_SIZE);
        let state = self.state.lock().unwrap();
        let (mut state, slot) = self.access(state, sector);
        if src.is_empty() {
            return;
        }
        state.slots[slot].data[offset..offset + src.len()].copy_from_slice(src);
        state.slots[slot].dirty = true;
    }

    /// Reads a whole sector as a [`Pod`] value.
    pub fn read_pod<T>(&self, sector: u32) -> T
    where
        T: Pod,
    {
        assert_eq!(size_of::<T>(), SECTOR_SIZE);
        let mut value = T::zeroed();
        self.read(sector, value.as_bytes_mut(), 0);
        value
    }

    /// Writes a whole sector from a [`Pod`] value.
    pub fn write_pod<T>(&self, sector: u32, value: &T)
    where
        T: Pod,
    {
        assert_eq!(size_of::<T>(), SECTOR_SIZE);
        self.write(sector, value.as_bytes(), 0);
    }

    /// Writes every dirty, ready slot back to the device.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        for slot in 0..state.slots.len() {
            if state.slots[slot].dirty && state.slots[slot].ready {
                state = self.clean(state, slot);
            }
        }
    }

    /// Test hook: flushes, then drops all residency.
    ///
    /// The caller must be the only user of the cache.
    pub fn reset(&self) {
        self.flush();
        let mut state = self.state.lock().unwrap();
        for slot in state.slots.iter_mut() {
            debug_assert!(slot.ready);
            slot.sector = None;
            slot.dirty = false;
        }
    }

    /// Makes `sector` resident and returns its slot, promoted to the front
    /// of the LRU list.
    fn access<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState<SECTOR_SIZE>>,
        sector: u32,
    ) -> (MutexGuard<'a, CacheState<SECTOR_SIZE>>, usize) {
        loop {
            if let Some(slot) = state.slots.iter().position(|s| s.sector == Some(sector)) {
                if !state.slots[slot].ready {
                    // Wait out the in-flight I/O, then start over: the owner
                    // may have rebound the slot in the meantime.
                    state = self.slot_ready[slot].wait(state).unwrap();
                    continue;
                }
                let lru = &mut state.lru;
                lru.retain(|&i| i != slot);
                lru.push_front(slot);
                return (state, slot);
            }

            // Not resident. Pick the least recently used ready slot.
            let candidate = state
                .lru
                .iter()
                .rev()
                .copied()
                .find(|&slot| state.slots[slot].ready);
            let Some(slot) = candidate else {
                state = self.any_ready.wait(state).unwrap();
                continue;
            };

            if state.slots[slot].dirty {
                state = self.clean(state, slot);
            } else {
                state = self.refill(state, slot, sector);
            }
            // Start over in either case: the mutex was released during the
            // I/O, so another thread may have claimed the slot or made the
            // target sector resident.
        }
    }

    /// Writes a dirty slot back in place. The slot keeps its sector binding
    /// so the next pass can either find the target resident or rebind this
    /// now-clean slot.
    fn clean<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState<SECTOR_SIZE>>,
        slot: usize,
    ) -> MutexGuard<'a, CacheState<SECTOR_SIZE>> {
        debug_assert!(state.slots[slot].ready && state.slots[slot].dirty);
        let sector = state.slots[slot].sector.expect("dirty slot must be bound");
        state.slots[slot].ready = false;
        let mut staged = [0; SECTOR_SIZE];
        staged.copy_from_slice(&state.slots[slot].data[..]);
        drop(state);

        self.device.write_sector(sector, &staged);

        let mut state = self.state.lock().unwrap();
        state.slots[slot].dirty = false;
        state.slots[slot].ready = true;
        self.slot_ready[slot].notify_all();
        self.any_ready.notify_all();
        state
    }

    /// Rebinds a clean slot to `sector` and fills it from the device.
    fn refill<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState<SECTOR_SIZE>>,
        slot: usize,
        sector: u32,
    ) -> MutexGuard<'a, CacheState<SECTOR_SIZE>> {
        debug_assert!(state.slots[slot].ready && !state.slots[slot].dirty);
        state.slots[slot].sector = Some(sector);
        state.slots[slot].ready = false;
        drop(state);

        let mut staged = [0; SECTOR_SIZE];
        self.device.read_sector(sector, &mut staged);

        let mut state = self.state.lock().unwrap();
        state.slots[slot].data.copy_from_slice(&staged);
        state.slots[slot].ready = true;
        self.slot_ready[slot].notify_all();
        self.any_ready.notify_all();
        state
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.state.lock().unwrap();
        for (i, a) in state.slots.iter().enumerate() {
            if a.sector.is_none() {
                continue;
            }
            for b in &state.slots[i + 1..] {
                assert_ne!(a.sector, b.sector, "sector resident in two slots");
            }
        }
        let mut seen: Vec<usize> = state.lru.iter().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..state.slots.len()).collect::<Vec<_>>());
    }
}
