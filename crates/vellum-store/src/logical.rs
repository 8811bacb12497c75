//! Logical row ids: the translation table.
//!
//! A logical id stays stable for the lifetime of a record; updates that
//! relocate the record only rewrite the translation slot it points at.
//! External references holding the id (other records, index nodes) stay
//! valid across physical relocation.
//!
//! Translation page layout:
//! - page header (24 bytes)
//! - count: 2 bytes (+ 6 reserved): high-water slot count
//! - slots: 16 bytes each (packed physical location: u64, in_use: u8)

use crate::block::BlockStore;
use crate::freeids;
use crate::page::{self, PageHeader, PageType, PAGE_HEADER_SIZE};
use vellum_common::{Location, RecordId, Result, VellumError, BLOCK_SIZE};

const COUNT_OFFSET: usize = PAGE_HEADER_SIZE;
const SLOTS_START: usize = PAGE_HEADER_SIZE + 8;
const SLOT_SIZE: usize = 16;

/// Translation slots per page.
pub const SLOTS_PER_PAGE: usize = (BLOCK_SIZE - SLOTS_START) / SLOT_SIZE;

fn slot_offset(slot: u16) -> usize {
    SLOTS_START + slot as usize * SLOT_SIZE
}

/// Allocates a logical id for a physical location.
///
/// A previously freed id is reused when the pool has one; otherwise the
/// next slot of the tail translation page is taken, extending the
/// translation list when the tail is full.
pub fn insert(store: &mut BlockStore, loc: Location) -> Result<RecordId> {
    if let Some(id) = freeids::get_logical(store)? {
        write_slot(store, id, loc)?;
        return Ok(id);
    }

    let page_id = match page::last(store, PageType::Translation)? {
        Some(tail) => {
            let block = store.get(tail)?;
            let count = block.read_u16(COUNT_OFFSET);
            store.release(block, false)?;
            if (count as usize) < SLOTS_PER_PAGE {
                tail
            } else {
                page::allocate(store, PageType::Translation)?
            }
        }
        None => page::allocate(store, PageType::Translation)?,
    };

    let mut block = store.get(page_id)?;
    let slot = block.read_u16(COUNT_OFFSET);
    let offset = slot_offset(slot);
    block.write_u64(offset, loc.as_u64());
    block.write_u8(offset + 8, 1);
    block.write_u16(COUNT_OFFSET, slot + 1);
    store.release(block, true)?;

    Ok(RecordId::new(page_id, slot))
}

/// Resolves a logical id to its current physical location.
pub fn fetch(store: &mut BlockStore, id: RecordId) -> Result<Location> {
    let (block, offset) = checked_slot(store, id)?;
    let phys = block.read_u64(offset);
    store.release(block, false)?;
    Ok(Location::from_u64(phys))
}

/// Re-targets a logical id at a new physical location.
///
/// The id itself never changes; this is what keeps external references
/// valid when a record moves.
pub fn update(store: &mut BlockStore, id: RecordId, loc: Location) -> Result<()> {
    let (mut block, offset) = checked_slot(store, id)?;
    block.write_u64(offset, loc.as_u64());
    store.release(block, true)
}

/// Releases a logical id, returning it to the free-logical-id pool.
pub fn delete(store: &mut BlockStore, id: RecordId) -> Result<()> {
    let (mut block, offset) = checked_slot(store, id)?;
    block.write_u64(offset, 0);
    block.write_u8(offset + 8, 0);
    store.release(block, true)?;

    freeids::put_logical(store, id)
}

/// Rewrites a pooled id's slot on reuse.
fn write_slot(store: &mut BlockStore, id: RecordId, loc: Location) -> Result<()> {
    let mut block = store.get(id.block())?;
    let offset = slot_offset(id.slot());
    block.write_u64(offset, loc.as_u64());
    block.write_u8(offset + 8, 1);
    store.release(block, true)
}

/// Validates an id and checks out the translation page holding its slot.
fn checked_slot(
    store: &mut BlockStore,
    id: RecordId,
) -> Result<(crate::block::Block, usize)> {
    if !id.is_valid() {
        return Err(VellumError::InvalidRecordId { id: id.0 });
    }
    if id.slot() as usize >= SLOTS_PER_PAGE {
        return Err(VellumError::InvalidRecordId { id: id.0 });
    }
    if id.block() >= store.num_blocks() {
        return Err(VellumError::RecordNotFound { id: id.0 });
    }

    let block = store.get(id.block())?;
    let header = PageHeader::from_bytes(&block.data()[..PAGE_HEADER_SIZE]);
    let is_translation = matches!(
        header,
        Ok(PageHeader {
            page_type: PageType::Translation,
            ..
        })
    );
    if !is_translation {
        store.discard(block)?;
        return Err(VellumError::RecordNotFound { id: id.0 });
    }

    let offset = slot_offset(id.slot());
    if block.read_u8(offset + 8) == 0 {
        store.release(block, false)?;
        return Err(VellumError::RecordNotFound { id: id.0 });
    }
    Ok((block, offset))
}
