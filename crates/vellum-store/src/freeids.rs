//! Pools of reclaimed ids.
//!
//! Freed logical ids and freed physical slots are kept in dedicated page
//! lists so later inserts can recycle them instead of growing the file.
//!
//! Pool page layout:
//! - page header (24 bytes)
//! - count: 2 bytes (+ 6 reserved)
//! - entries
//!
//! Logical entries are packed record ids (8 bytes). Physical entries are
//! a packed location plus the slot's capacity (16 bytes per entry).

use crate::block::BlockStore;
use crate::page::{self, PageType, PAGE_HEADER_SIZE};
use vellum_common::{BlockId, Location, RecordId, Result, BLOCK_SIZE};

const COUNT_OFFSET: usize = PAGE_HEADER_SIZE;
const ENTRIES_START: usize = PAGE_HEADER_SIZE + 8;

const LOGICAL_ENTRY_SIZE: usize = 8;
/// Reclaimed logical ids held per pool page.
pub const LOGICAL_IDS_PER_PAGE: usize = (BLOCK_SIZE - ENTRIES_START) / LOGICAL_ENTRY_SIZE;

const PHYSICAL_ENTRY_SIZE: usize = 16;
/// Reclaimed physical slots held per pool page.
pub const PHYSICAL_SLOTS_PER_PAGE: usize = (BLOCK_SIZE - ENTRIES_START) / PHYSICAL_ENTRY_SIZE;

/// A reused slot may be at most this much larger than the record placed
/// into it; bigger slots stay pooled for bigger records.
const MAX_SLOT_WASTE: u32 = 1024;

/// Adds a reclaimed logical id to the pool.
pub fn put_logical(store: &mut BlockStore, id: RecordId) -> Result<()> {
    let page_id = pool_tail_with_space(
        store,
        PageType::FreeLogicalIds,
        LOGICAL_IDS_PER_PAGE,
    )?;

    let mut block = store.get(page_id)?;
    let count = block.read_u16(COUNT_OFFSET);
    block.write_u64(
        ENTRIES_START + count as usize * LOGICAL_ENTRY_SIZE,
        id.0,
    );
    block.write_u16(COUNT_OFFSET, count + 1);
    store.release(block, true)
}

/// Pops a reclaimed logical id from the pool, if any.
pub fn get_logical(store: &mut BlockStore) -> Result<Option<RecordId>> {
    loop {
        let page_id = match page::last(store, PageType::FreeLogicalIds)? {
            Some(id) => id,
            None => return Ok(None),
        };

        let mut block = store.get(page_id)?;
        let count = block.read_u16(COUNT_OFFSET);
        if count == 0 {
            // Emptied page left behind; reclaim it and try the new tail.
            store.release(block, false)?;
            page::free(store, PageType::FreeLogicalIds, page_id)?;
            continue;
        }

        let new_count = count - 1;
        let id = RecordId(block.read_u64(
            ENTRIES_START + new_count as usize * LOGICAL_ENTRY_SIZE,
        ));
        block.write_u16(COUNT_OFFSET, new_count);
        store.release(block, true)?;

        if new_count == 0 {
            page::free(store, PageType::FreeLogicalIds, page_id)?;
        }
        return Ok(Some(id));
    }
}

/// Adds a reclaimed physical slot to the pool.
pub fn put_physical(store: &mut BlockStore, loc: Location, available: u32) -> Result<()> {
    let page_id = pool_tail_with_space(
        store,
        PageType::FreePhysicalIds,
        PHYSICAL_SLOTS_PER_PAGE,
    )?;

    let mut block = store.get(page_id)?;
    let count = block.read_u16(COUNT_OFFSET);
    let offset = ENTRIES_START + count as usize * PHYSICAL_ENTRY_SIZE;
    block.write_u64(offset, loc.as_u64());
    block.write_u32(offset + 8, available);
    block.write_u16(COUNT_OFFSET, count + 1);
    store.release(block, true)
}

/// Finds a pooled physical slot that can hold `size` bytes without
/// excessive waste. Returns the slot's location and capacity.
pub fn get_physical(store: &mut BlockStore, size: u32) -> Result<Option<(Location, u32)>> {
    let mut cursor = page::first(store, PageType::FreePhysicalIds)?;

    while let Some(page_id) = cursor {
        let mut block = store.get(page_id)?;
        let count = block.read_u16(COUNT_OFFSET);

        for i in 0..count as usize {
            let offset = ENTRIES_START + i * PHYSICAL_ENTRY_SIZE;
            let available = block.read_u32(offset + 8);
            if available >= size && available - size <= MAX_SLOT_WASTE {
                let loc = Location::from_u64(block.read_u64(offset));

                // Swap the last entry into the vacated position.
                let last = ENTRIES_START + (count as usize - 1) * PHYSICAL_ENTRY_SIZE;
                if last != offset {
                    let last_loc = block.read_u64(last);
                    let last_avail = block.read_u32(last + 8);
                    block.write_u64(offset, last_loc);
                    block.write_u32(offset + 8, last_avail);
                }
                let new_count = count - 1;
                block.write_u16(COUNT_OFFSET, new_count);
                store.release(block, true)?;

                if new_count == 0 {
                    page::free(store, PageType::FreePhysicalIds, page_id)?;
                }
                return Ok(Some((loc, available)));
            }
        }

        store.release(block, false)?;
        cursor = page::next(store, page_id)?;
    }

    Ok(None)
}

/// Returns the tail pool page with at least one free entry, allocating a
/// fresh page when the list is empty or the tail is full.
fn pool_tail_with_space(
    store: &mut BlockStore,
    ty: PageType,
    capacity: usize,
) -> Result<BlockId> {
    if let Some(tail) = page::last(store, ty)? {
        let block = store.get(tail)?;
        let count = block.read_u16(COUNT_OFFSET);
        store.release(block, false)?;
        if (count as usize) < capacity {
            return Ok(tail);
        }
    }
    page::allocate(store, ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vellum_common::StoreConfig;

    fn create_test_store() -> (BlockStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            fsync_enabled: false,
            ..StoreConfig::default()
        };
        let store = BlockStore::open(&dir.path().join("t"), config).unwrap();
        (store, dir)
    }

    #[test]
    fn test_logical_pool_lifo() {
        let (mut store, _dir) = create_test_store();

        assert_eq!(get_logical(&mut store).unwrap(), None);

        put_logical(&mut store, RecordId::new(2, 0)).unwrap();
        put_logical(&mut store, RecordId::new(2, 1)).unwrap();

        assert_eq!(get_logical(&mut store).unwrap(), Some(RecordId::new(2, 1)));
        assert_eq!(get_logical(&mut store).unwrap(), Some(RecordId::new(2, 0)));
        assert_eq!(get_logical(&mut store).unwrap(), None);
    }

    #[test]
    fn test_logical_pool_frees_emptied_pages() {
        let (mut store, _dir) = create_test_store();

        put_logical(&mut store, RecordId::new(3, 7)).unwrap();
        assert!(page::first(&mut store, PageType::FreeLogicalIds)
            .unwrap()
            .is_some());

        get_logical(&mut store).unwrap();
        assert!(page::first(&mut store, PageType::FreeLogicalIds)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_logical_pool_spills_to_second_page() {
        let (mut store, _dir) = create_test_store();

        for i in 0..(LOGICAL_IDS_PER_PAGE + 3) {
            put_logical(&mut store, RecordId::new(5, i as u16)).unwrap();
        }

        // Two pool pages now exist.
        let first = page::first(&mut store, PageType::FreeLogicalIds)
            .unwrap()
            .unwrap();
        assert!(page::next(&mut store, first).unwrap().is_some());

        // Drain everything back out.
        let mut drained = 0;
        while get_logical(&mut store).unwrap().is_some() {
            drained += 1;
        }
        assert_eq!(drained, LOGICAL_IDS_PER_PAGE + 3);
    }

    #[test]
    fn test_physical_pool_first_fit() {
        let (mut store, _dir) = create_test_store();

        put_physical(&mut store, Location::new(4, 32), 64).unwrap();
        put_physical(&mut store, Location::new(4, 200), 512).unwrap();

        // A 100-byte request skips the 64-byte slot.
        let (loc, available) = get_physical(&mut store, 100).unwrap().unwrap();
        assert_eq!(loc, Location::new(4, 200));
        assert_eq!(available, 512);

        let (loc, available) = get_physical(&mut store, 16).unwrap().unwrap();
        assert_eq!(loc, Location::new(4, 32));
        assert_eq!(available, 64);

        assert_eq!(get_physical(&mut store, 16).unwrap(), None);
    }

    #[test]
    fn test_physical_pool_rejects_wasteful_match() {
        let (mut store, _dir) = create_test_store();

        put_physical(&mut store, Location::new(4, 32), 4000).unwrap();

        // A tiny record must not burn a 4000-byte slot.
        assert_eq!(get_physical(&mut store, 16).unwrap(), None);
        assert!(get_physical(&mut store, 3500).unwrap().is_some());
    }
}
