//! Physical row storage: variable-length records inside data pages.
//!
//! Data page layout:
//! ```text
//! +--------------------+
//! | Page Header (24)   |
//! +--------------------+
//! | free: u16 (+pad)   |  <- offset where unused space begins
//! +--------------------+
//! | Record slots       |  <- header + data, allocated front to back
//! |  ...               |
//! +--------------------+
//! ```
//!
//! A record slot starts with an 8-byte record header (`available` capacity,
//! `current` length) followed by the data. A slot whose capacity does not
//! fit in its starting page continues in the following pages of the data
//! list; the record header itself never straddles a page boundary.
//! Capacities are rounded up to a 16-byte class so records can grow a
//! little in place.

use crate::block::BlockStore;
use crate::freeids;
use crate::page::{self, PageHeader, PageType, PAGE_HEADER_SIZE};
use vellum_common::{Location, Result, VellumError, BLOCK_SIZE};

const FREE_OFFSET: usize = PAGE_HEADER_SIZE;
/// Offset where record slots begin within a data page.
pub const DATA_START: usize = PAGE_HEADER_SIZE + 8;
/// Record bytes a single data page can hold.
pub const DATA_CAPACITY: usize = BLOCK_SIZE - DATA_START;
/// Size of a record slot header in bytes.
pub const RECORD_HEADER_SIZE: usize = 8;

const OFF_AVAILABLE: usize = 0;
const OFF_CURRENT: usize = 4;

/// Rounds a record size up to its capacity class.
fn capacity_class(size: usize) -> u32 {
    let size = size.max(1);
    ((size + 15) / 16 * 16) as u32
}

fn read_free(block: &crate::block::Block) -> usize {
    let raw = block.read_u16(FREE_OFFSET) as usize;
    // A freshly allocated page has a zeroed body.
    if raw < DATA_START {
        DATA_START
    } else {
        raw
    }
}

/// Writes a byte array into available slot space, allocating continuation
/// pages as needed, and returns the record's physical location.
pub fn insert(store: &mut BlockStore, data: &[u8]) -> Result<Location> {
    let size = data.len() as u32;

    // Recycle a freed slot when one of suitable capacity exists.
    if let Some((loc, _available)) = freeids::get_physical(store, size)? {
        write_data(store, loc, data)?;
        return Ok(loc);
    }

    let loc = alloc_tail(store, capacity_class(data.len()))?;
    write_data(store, loc, data)?;
    Ok(loc)
}

/// Reserves a slot of `capacity` bytes at the tail of the data list and
/// stamps its record header.
fn alloc_tail(store: &mut BlockStore, capacity: u32) -> Result<Location> {
    // Find the page the slot starts in: the tail page if its remaining
    // space fits at least the record header, else a fresh page.
    let mut start_page = match page::last(store, PageType::Data)? {
        Some(tail) => {
            let block = store.get(tail)?;
            let free = read_free(&block);
            store.release(block, false)?;
            if BLOCK_SIZE - free >= RECORD_HEADER_SIZE {
                Some((tail, free))
            } else {
                None
            }
        }
        None => None,
    };
    if start_page.is_none() {
        let fresh = page::allocate(store, PageType::Data)?;
        start_page = Some((fresh, DATA_START));
    }
    let (start_block, start_offset) = start_page.expect("start page chosen");

    let loc = Location::new(start_block, start_offset as u16);

    // Stamp the header and consume in-page capacity.
    let mut block = store.get(start_block)?;
    block.write_u32(start_offset + OFF_AVAILABLE, capacity);
    block.write_u32(start_offset + OFF_CURRENT, 0);
    let in_page = BLOCK_SIZE - (start_offset + RECORD_HEADER_SIZE);
    let mut remaining = capacity as usize;
    if remaining <= in_page {
        block.write_u16(FREE_OFFSET, (start_offset + RECORD_HEADER_SIZE + remaining) as u16);
        remaining = 0;
    } else {
        block.write_u16(FREE_OFFSET, BLOCK_SIZE as u16);
        remaining -= in_page;
    }
    store.release(block, true)?;

    // Spill the rest of the capacity into freshly allocated continuation
    // pages; page::allocate appends them to the data list, which is the
    // chain fetch walks.
    while remaining > 0 {
        let cont = page::allocate(store, PageType::Data)?;
        let consumed = remaining.min(DATA_CAPACITY);
        let mut block = store.get(cont)?;
        block.write_u16(FREE_OFFSET, (DATA_START + consumed) as u16);
        store.release(block, true)?;
        remaining -= consumed;
    }

    Ok(loc)
}

/// Overwrites the data of an allocated slot and updates its length.
fn write_data(store: &mut BlockStore, loc: Location, data: &[u8]) -> Result<()> {
    let offset = loc.offset as usize;
    let mut block = store.get(loc.block)?;
    block.write_u32(offset + OFF_CURRENT, data.len() as u32);

    let in_page = (BLOCK_SIZE - (offset + RECORD_HEADER_SIZE)).min(data.len());
    let data_start = offset + RECORD_HEADER_SIZE;
    block.data_mut()[data_start..data_start + in_page].copy_from_slice(&data[..in_page]);
    let mut next = PageHeader::from_bytes(&block.data()[..PAGE_HEADER_SIZE])?.next;
    store.release(block, true)?;

    let mut written = in_page;
    while written < data.len() {
        if next == 0 {
            return Err(VellumError::Corrupted {
                reason: format!("record chain broken at {}", loc),
            });
        }
        let mut block = store.get(next)?;
        let n = (data.len() - written).min(DATA_CAPACITY);
        block.data_mut()[DATA_START..DATA_START + n]
            .copy_from_slice(&data[written..written + n]);
        next = PageHeader::from_bytes(&block.data()[..PAGE_HEADER_SIZE])?.next;
        store.release(block, true)?;
        written += n;
    }
    Ok(())
}

/// Reads a record back, walking its continuation chain transparently.
pub fn fetch(store: &mut BlockStore, loc: Location) -> Result<Vec<u8>> {
    let offset = loc.offset as usize;
    if offset < DATA_START || offset + RECORD_HEADER_SIZE > BLOCK_SIZE {
        return Err(VellumError::Corrupted {
            reason: format!("record offset out of range: {}", loc),
        });
    }

    let block = store.get(loc.block)?;
    let len = block.read_u32(offset + OFF_CURRENT) as usize;
    let mut out = Vec::with_capacity(len);

    let in_page = (BLOCK_SIZE - (offset + RECORD_HEADER_SIZE)).min(len);
    let data_start = offset + RECORD_HEADER_SIZE;
    out.extend_from_slice(&block.data()[data_start..data_start + in_page]);
    let mut next = PageHeader::from_bytes(&block.data()[..PAGE_HEADER_SIZE])?.next;
    store.release(block, false)?;

    while out.len() < len {
        if next == 0 {
            return Err(VellumError::Corrupted {
                reason: format!("record chain broken at {}", loc),
            });
        }
        let block = store.get(next)?;
        let n = (len - out.len()).min(DATA_CAPACITY);
        out.extend_from_slice(&block.data()[DATA_START..DATA_START + n]);
        next = PageHeader::from_bytes(&block.data()[..PAGE_HEADER_SIZE])?.next;
        store.release(block, false)?;
    }
    Ok(out)
}

/// Rewrites a record.
///
/// Overwrites in place when the new data fits the slot's capacity class;
/// otherwise the slot is freed and the data re-inserted. The returned
/// location is authoritative: callers must update any indirection that
/// still points at the old one.
pub fn update(store: &mut BlockStore, loc: Location, data: &[u8]) -> Result<Location> {
    let block = store.get(loc.block)?;
    let available = block.read_u32(loc.offset as usize + OFF_AVAILABLE);
    store.release(block, false)?;

    if data.len() as u32 <= available {
        write_data(store, loc, data)?;
        Ok(loc)
    } else {
        delete(store, loc)?;
        insert(store, data)
    }
}

/// Frees a record slot, returning it to the free-physical-id pool.
pub fn delete(store: &mut BlockStore, loc: Location) -> Result<()> {
    let mut block = store.get(loc.block)?;
    let available = block.read_u32(loc.offset as usize + OFF_AVAILABLE);
    block.write_u32(loc.offset as usize + OFF_CURRENT, 0);
    store.release(block, true)?;

    freeids::put_physical(store, loc, available)
}
