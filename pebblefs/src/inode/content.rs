//! Inode content: the three-tier sector index and the chunked copy loops.
//!
//! Byte `pos` of a file lives in block `pos / SECTOR_SIZE`. The first
//! `NUM_DIRECT` blocks sit in the inode itself, the next `PTRS_PER_BLOCK`
//! behind the indirect block, and the rest behind the double-indirect block.
//! Pointer blocks are themselves sectors fetched through the cache.

use pebble_fs_types::{
    DiskInode, IndirectBlock, MAX_FILE_BYTES, NUM_DIRECT, PTRS_PER_BLOCK, SECTOR_SIZE, SectorNo,
    bytes_to_sectors,
};

use crate::{device::Cache, error::Error, free_map::FreeMap};

/// Returns the sector holding byte `pos`, or `None` for `pos >= length`.
pub(crate) fn byte_to_sector(cache: &Cache, disk: &DiskInode, pos: usize) -> Option<SectorNo> {
    if pos >= disk.length() {
        return None;
    }
    let block = pos / SECTOR_SIZE;
    if block < NUM_DIRECT {
        return disk.direct(block);
    }

    let block = block - NUM_DIRECT;
    if block < PTRS_PER_BLOCK {
        let indirect: IndirectBlock = cache.read_pod(disk.indirect()?.value());
        return indirect.get(block);
    }

    let block = block - PTRS_PER_BLOCK;
    let double: IndirectBlock = cache.read_pod(disk.double_indirect()?.value());
    let indirect_sector = double.get(block / PTRS_PER_BLOCK)?;
    let indirect: IndirectBlock = cache.read_pod(indirect_sector.value());
    indirect.get(block % PTRS_PER_BLOCK)
}

/// Installs sectors for every block up to `new_len` bytes, allocating
/// pointer blocks on demand. Forward-only: sectors granted before a failure
/// are not returned.
///
/// The caller commits the new length afterwards; until then readers keep
/// seeing the old one.
pub(crate) fn extend(
    cache: &Cache,
    free_map: &FreeMap,
    disk: &mut DiskInode,
    new_len: usize,
) -> Result<(), Error> {
    if new_len > MAX_FILE_BYTES {
        return Err(Error::FileTooLarge);
    }
    for block in 0..bytes_to_sectors(new_len) {
        ensure_mapped(cache, free_map, disk, block)?;
    }
    Ok(())
}

/// Takes a free sector and zeroes it through the cache, so just-granted
/// ranges read back as zeros rather than stale bytes.
fn alloc_zeroed(cache: &Cache, free_map: &FreeMap) -> Result<SectorNo, Error> {
    const ZEROS: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];
    let sector = free_map.allocate(1).ok_or(Error::NoSpace)?;
    cache.write(sector.value(), &ZEROS, 0);
    Ok(sector)
}

/// Returns the data sector for block index `block`, allocating it (and any
/// pointer block on the way) if the index does not reach that far yet.
fn ensure_mapped(
    cache: &Cache,
    free_map: &FreeMap,
    disk: &mut DiskInode,
    block: usize,
) -> Result<SectorNo, Error> {
    if block < NUM_DIRECT {
        if let Some(sector) = disk.direct(block) {
            return Ok(sector);
        }
        let sector = alloc_zeroed(cache, free_map)?;
        disk.set_direct(block, sector);
        return Ok(sector);
    }

    let block = block - NUM_DIRECT;
    if block < PTRS_PER_BLOCK {
        let indirect_sector = match disk.indirect() {
            Some(sector) => sector,
            None => {
                let sector = alloc_zeroed(cache, free_map)?;
                disk.set_indirect(sector);
                sector
            }
        };
        return ensure_entry(cache, free_map, indirect_sector, block);
    }

    let block = block - PTRS_PER_BLOCK;
    let double_sector = match disk.double_indirect() {
        Some(sector) => sector,
        None => {
            let sector = alloc_zeroed(cache, free_map)?;
            disk.set_double_indirect(sector);
            sector
        }
    };
    let indirect_sector = ensure_entry(cache, free_map, double_sector, block / PTRS_PER_BLOCK)?;
    ensure_entry(cache, free_map, indirect_sector, block % PTRS_PER_BLOCK)
}

/// Returns slot `i` of the pointer block at `block_sector`, filling the slot
/// with a fresh zeroed sector if it is empty.
fn ensure_entry(
    cache: &Cache,
    free_map: &FreeMap,
    block_sector: SectorNo,
    i: usize,
) -> Result<SectorNo, Error> {
    let mut block: IndirectBlock = cache.read_pod(block_sector.value());
    if let Some(sector) = block.get(i) {
        return Ok(sector);
    }
    let sector = alloc_zeroed(cache, free_map)?;
    block.set(i, sector);
    cache.write_pod(block_sector.value(), &block);
    Ok(sector)
}

/// Returns every sector of the file to the free map: data sectors, pointer
/// blocks, and finally the inode's own sector `own`.
pub(crate) fn release(cache: &Cache, free_map: &FreeMap, disk: &DiskInode, own: SectorNo) {
    let total = bytes_to_sectors(disk.length());

    for block in 0..total.min(NUM_DIRECT) {
        if let Some(sector) = disk.direct(block) {
            free_map.release(sector, 1);
        }
    }

    let mut remaining = total.saturating_sub(NUM_DIRECT);
    if remaining > 0 {
        if let Some(indirect_sector) = disk.indirect() {
            let indirect: IndirectBlock = cache.read_pod(indirect_sector.value());
            for i in 0..remaining.min(PTRS_PER_BLOCK) {
                if let Some(sector) = indirect.get(i) {
                    free_map.release(sector, 1);
                }
            }
            free_map.release(indirect_sector, 1);
        }
    }

    remaining = remaining.saturating_sub(PTRS_PER_BLOCK);
    if remaining > 0 {
        if let Some(double_sector) = disk.double_indirect() {
            let double: IndirectBlock = cache.read_pod(double_sector.value());
            for which in 0..remaining.div_ceil(PTRS_PER_BLOCK) {
                if let Some(indirect_sector) = double.get(which) {
                    let indirect: IndirectBlock = cache.read_pod(indirect_sector.value());
                    for i in 0..remaining.saturating_sub(which * PTRS_PER_BLOCK).min(PTRS_PER_BLOCK)
                    {
                        if let Some(sector) = indirect.get(i) {
                            free_map.release(sector, 1);
                        }
                    }
                    free_map.release(indirect_sector, 1);
                }
            }
            free_map.release(double_sector, 1);
        }
    }

    free_map.release(own, 1);
}

/// Copies as much of `buf` as the file covers, one in-sector chunk at a
/// time. `disk` is a snapshot taken while no extension was in flight.
pub(crate) fn read_chunks(cache: &Cache, disk: &DiskInode, buf: &mut [u8], offset: usize) -> usize {
    let length = disk.length();
    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done;
        let Some(sector) = byte_to_sector(cache, disk, pos) else {
            break;
        };
        let sector_ofs = pos % SECTOR_SIZE;
        let chunk = (buf.len() - done)
            .min(SECTOR_SIZE - sector_ofs)
            .min(length - pos);
        if chunk == 0 {
            break;
        }
        cache.read(sector.value(), &mut buf[done..done + chunk], sector_ofs);
        done += chunk;
    }
    done
}

/// Mirror of [`read_chunks`] for writes. Never writes past `disk.length()`.
pub(crate) fn write_chunks(cache: &Cache, disk: &DiskInode, buf: &[u8], offset: usize) -> usize {
    let length = disk.length();
    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done;
        let Some(sector) = byte_to_sector(cache, disk, pos) else {
            break;
        };
        let sector_ofs = pos % SECTOR_SIZE;
        let chunk = (buf.len() - done)
            .min(SECTOR_SIZE - sector_ofs)
            .min(length - pos);
        if chunk == 0 {
            break;
        }
        cache.write(sector.value(), &buf[done..done + chunk], sector_ofs);
        done += chunk;
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::device::{DynDevice, MemDisk};

    fn fixture(sectors: u32) -> (Cache, FreeMap) {
        let disk: DynDevice = Arc::new(MemDisk::new(sectors));
        (Cache::new(disk, 16), FreeMap::new(sectors))
    }

    #[test]
    fn empty_file_maps_nothing() {
        let (cache, _) = fixture(64);
        let disk = DiskInode::new(false);
        assert_eq!(byte_to_sector(&cache, &disk, 0), None);
    }

    #[test]
    fn extend_within_direct_allocates_no_pointer_blocks() {
        let (cache, free_map) = fixture(256);
        let mut disk = DiskInode::new(false);
        let len = NUM_DIRECT * SECTOR_SIZE;
        extend(&cache, &free_map, &mut disk, len).unwrap();
        disk.set_length(len);

        assert!(disk.indirect().is_none());
        assert!(disk.double_indirect().is_none());
        assert!(byte_to_sector(&cache, &disk, len - 1).is_some());
        assert_eq!(byte_to_sector(&cache, &disk, len), None);
    }

    #[test]
    fn one_byte_past_direct_allocates_exactly_one_indirect_block() {
        let (cache, free_map) = fixture(256);
        let mut disk = DiskInode::new(false);
        let len = NUM_DIRECT * SECTOR_SIZE + 1;

        let before = free_map.free_count();
        extend(&cache, &free_map, &mut disk, len).unwrap();
        disk.set_length(len);

        assert!(disk.indirect().is_some());
        assert!(disk.double_indirect().is_none());
        // One data sector for the new block, one for the indirect block.
        assert_eq!(free_map.free_count(), before - NUM_DIRECT as u32 - 2);
        assert!(byte_to_sector(&cache, &disk, len - 1).is_some());
    }

    #[test]
    fn double_indirect_tier_maps_blocks() {
        let (cache, free_map) = fixture(2048);
        let mut disk = DiskInode::new(false);
        let len = (NUM_DIRECT + PTRS_PER_BLOCK + 3) * SECTOR_SIZE;
        extend(&cache, &free_map, &mut disk, len).unwrap();
        disk.set_length(len);

        assert!(disk.double_indirect().is_some());
        let last = byte_to_sector(&cache, &disk, len - 1).unwrap();
        let first_doubled =
            byte_to_sector(&cache, &disk, (NUM_DIRECT + PTRS_PER_BLOCK) * SECTOR_SIZE).unwrap();
        assert_ne!(last, first_doubled);
    }

    #[test]
    fn extend_is_idempotent_over_mapped_blocks() {
        let (cache, free_map) = fixture(256);
        let mut disk = DiskInode::new(false);
        extend(&cache, &free_map, &mut disk, 4 * SECTOR_SIZE).unwrap();
        disk.set_length(4 * SECTOR_SIZE);
        let before = free_map.free_count();

        // Growing re-walks the mapped prefix without reallocating it.
        extend(&cache, &free_map, &mut disk, 6 * SECTOR_SIZE).unwrap();
        disk.set_length(6 * SECTOR_SIZE);
        assert_eq!(free_map.free_count(), before - 2);
    }

    #[test]
    fn over_limit_extension_fails() {
        let (cache, free_map) = fixture(64);
        let mut disk = DiskInode::new(false);
        assert_eq!(
            extend(&cache, &free_map, &mut disk, MAX_FILE_BYTES + 1),
            Err(Error::FileTooLarge)
        );
    }

    #[test]
    fn exhaustion_fails_forward_only() {
        let (cache, free_map) = fixture(8);
        let mut disk = DiskInode::new(false);
        let before = free_map.free_count();
        assert_eq!(
            extend(&cache, &free_map, &mut disk, 32 * SECTOR_SIZE),
            Err(Error::NoSpace)
        );
        // Sectors granted before the failure stay taken.
        assert_eq!(free_map.free_count(), 0);
        assert!(before > 0);
    }

    #[test]
    fn release_returns_every_sector() {
        let (cache, free_map) = fixture(512);
        let own = free_map.allocate(1).unwrap();
        let mut disk = DiskInode::new(false);
        let len = (NUM_DIRECT + 5) * SECTOR_SIZE;
        extend(&cache, &free_map, &mut disk, len).unwrap();
        disk.set_length(len);

        let before = free_map.free_count();
        release(&cache, &free_map, &disk, own);
        // Data sectors, the indirect block, and the inode sector come back.
        assert_eq!(
            free_map.free_count(),
            before + (NUM_DIRECT + 5) as u32 + 1 + 1
        );
    }

    #[test]
    fn chunk_loops_round_trip_across_sector_boundaries() {
        let (cache, free_map) = fixture(256);
        let mut disk = DiskInode::new(false);
        let len = 3 * SECTOR_SIZE;
        extend(&cache, &free_map, &mut disk, len).unwrap();
        disk.set_length(len);

        let pattern: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let offset = SECTOR_SIZE - 100;
        assert_eq!(write_chunks(&cache, &disk, &pattern, offset), pattern.len());

        let mut back = vec![0u8; pattern.len()];
        assert_eq!(read_chunks(&cache, &disk, &mut back, offset), back.len());
        assert_eq!(back, pattern);
    }

    #[test]
    fn reads_stop_at_end_of_file() {
        let (cache, free_map) = fixture(64);
        let mut disk = DiskInode::new(false);
        extend(&cache, &free_map, &mut disk, 100).unwrap();
        disk.set_length(100);

        let mut buf = vec![0u8; 200];
        assert_eq!(read_chunks(&cache, &disk, &mut buf, 0), 100);
        assert_eq!(read_chunks(&cache, &disk, &mut buf, 100), 0);
    }
}
