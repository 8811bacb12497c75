//! Typed page lists over the block store.
//!
//! Every block except the file header is a page: a node of one of five
//! doubly-linked lists (free, data, translation, free-logical-ids,
//! free-physical-ids) whose first/last anchors live in the file header.
//! Traversal is explicit id lookup through the block store; ids survive
//! process restart, unlike in-memory references.
//!
//! Page header layout (24 bytes at the start of each page):
//! - page_type: 1 byte
//! - reserved: 7 bytes
//! - prev: 8 bytes (0 = none)
//! - next: 8 bytes (0 = none)

use crate::block::BlockStore;
use log::trace;
use vellum_common::{BlockId, Result, VellumError};

/// Number of page types / typed lists.
pub const PAGE_TYPE_COUNT: usize = 5;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 24;

const OFF_TYPE: usize = 0;
const OFF_PREV: usize = 8;
const OFF_NEXT: usize = 16;

/// Page types in Vellum storage.
///
/// Tag 0 is deliberately unused so a zeroed block never parses as a valid
/// page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    /// Recycled page awaiting reuse.
    Free = 1,
    /// Data page holding physical record slots.
    Data = 2,
    /// Translation page mapping logical ids to physical locations.
    Translation = 3,
    /// Pool page of reclaimed logical ids.
    FreeLogicalIds = 4,
    /// Pool page of reclaimed physical slots.
    FreePhysicalIds = 5,
}

impl PageType {
    /// Returns the index of this type's list in the file header.
    pub fn list_index(self) -> usize {
        self as usize - 1
    }
}

impl TryFrom<u8> for PageType {
    type Error = VellumError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageType::Free),
            2 => Ok(PageType::Data),
            3 => Ok(PageType::Translation),
            4 => Ok(PageType::FreeLogicalIds),
            5 => Ok(PageType::FreePhysicalIds),
            _ => Err(VellumError::Corrupted {
                reason: format!("invalid page type tag: {}", value),
            }),
        }
    }
}

impl std::fmt::Display for PageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PageType::Free => "free",
            PageType::Data => "data",
            PageType::Translation => "translation",
            PageType::FreeLogicalIds => "free-logical-ids",
            PageType::FreePhysicalIds => "free-physical-ids",
        };
        write!(f, "{}", name)
    }
}

/// Parsed page header: type tag plus prev/next links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Type of this page.
    pub page_type: PageType,
    /// Previous page in the list (0 = head).
    pub prev: BlockId,
    /// Next page in the list (0 = tail).
    pub next: BlockId,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = PAGE_HEADER_SIZE;

    /// Creates a detached header of the given type.
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            prev: 0,
            next: 0,
        }
    }

    /// Parses the header from the front of a page buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let page_type = PageType::try_from(data[OFF_TYPE])?;
        let prev = u64::from_le_bytes(data[OFF_PREV..OFF_PREV + 8].try_into().expect("8 bytes"));
        let next = u64::from_le_bytes(data[OFF_NEXT..OFF_NEXT + 8].try_into().expect("8 bytes"));
        Ok(Self {
            page_type,
            prev,
            next,
        })
    }

    /// Writes the header into the front of a page buffer.
    pub fn write_to(&self, data: &mut [u8]) {
        data[OFF_TYPE] = self.page_type as u8;
        data[OFF_TYPE + 1..OFF_PREV].fill(0);
        data[OFF_PREV..OFF_PREV + 8].copy_from_slice(&self.prev.to_le_bytes());
        data[OFF_NEXT..OFF_NEXT + 8].copy_from_slice(&self.next.to_le_bytes());
    }
}

/// Reads the page header of `id`.
pub fn read_page_header(store: &mut BlockStore, id: BlockId) -> Result<PageHeader> {
    let block = store.get(id)?;
    let header = PageHeader::from_bytes(&block.data()[..PAGE_HEADER_SIZE]);
    match header {
        Ok(header) => {
            store.release(block, false)?;
            Ok(header)
        }
        Err(e) => {
            store.discard(block)?;
            Err(e)
        }
    }
}

fn write_page_header(store: &mut BlockStore, id: BlockId, header: PageHeader) -> Result<()> {
    let mut block = store.get(id)?;
    header.write_to(&mut block.data_mut()[..]);
    store.release(block, true)
}

/// Allocates a page of the given type.
///
/// Pops the head of the free list when one is available, otherwise extends
/// the file by one block. The new page is linked at the tail of its type's
/// list and its body is zeroed.
pub fn allocate(store: &mut BlockStore, ty: PageType) -> Result<BlockId> {
    if ty == PageType::Free {
        return Err(VellumError::Internal(
            "free pages are never allocated; pages only become free".to_string(),
        ));
    }

    let mut header = store.read_header()?;

    // Reuse a free page if the free list is non-empty.
    let free_list = header.list(PageType::Free);
    let id = if free_list.first != 0 {
        let id = free_list.first;
        let page = read_page_header(store, id)?;
        let mut new_free = free_list;
        new_free.first = page.next;
        if page.next != 0 {
            let mut next_header = read_page_header(store, page.next)?;
            next_header.prev = 0;
            write_page_header(store, page.next, next_header)?;
        } else {
            new_free.last = 0;
        }
        header.set_list(PageType::Free, new_free);
        id
    } else {
        store.allocate_block_id()
    };

    // Link at the tail of the target list.
    let mut list = header.list(ty);
    let mut page = PageHeader::new(ty);
    page.prev = list.last;
    if list.last != 0 {
        let mut tail_header = read_page_header(store, list.last)?;
        tail_header.next = id;
        write_page_header(store, list.last, tail_header)?;
    }
    list.last = id;
    if list.first == 0 {
        list.first = id;
    }
    header.set_list(ty, list);

    // Initialize the page with a zeroed body.
    let mut block = store.get(id)?;
    block.data_mut().fill(0);
    page.write_to(&mut block.data_mut()[..]);
    store.release(block, true)?;

    store.write_header(&header)?;
    trace!("allocated {} page {}", ty, id);
    Ok(id)
}

/// Unlinks a page from its list and pushes it onto the front of the free
/// list.
pub fn free(store: &mut BlockStore, ty: PageType, id: BlockId) -> Result<()> {
    if ty == PageType::Free {
        return Err(VellumError::Internal(
            "the free list itself cannot be freed into".to_string(),
        ));
    }
    if id == 0 {
        return Err(VellumError::InvalidPageOperation(
            "cannot free the header block".to_string(),
        ));
    }

    let page = read_page_header(store, id)?;
    if page.page_type != ty {
        return Err(VellumError::PageTypeMismatch {
            block: id,
            expected: ty as u8,
            actual: page.page_type as u8,
        });
    }

    let mut header = store.read_header()?;

    // Unlink from the typed list.
    let mut list = header.list(ty);
    if page.prev != 0 {
        let mut prev_header = read_page_header(store, page.prev)?;
        prev_header.next = page.next;
        write_page_header(store, page.prev, prev_header)?;
    } else {
        list.first = page.next;
    }
    if page.next != 0 {
        let mut next_header = read_page_header(store, page.next)?;
        next_header.prev = page.prev;
        write_page_header(store, page.next, next_header)?;
    } else {
        list.last = page.prev;
    }
    header.set_list(ty, list);

    // Push onto the front of the free list.
    let mut free_list = header.list(PageType::Free);
    let mut freed = PageHeader::new(PageType::Free);
    freed.next = free_list.first;
    if free_list.first != 0 {
        let mut old_head = read_page_header(store, free_list.first)?;
        old_head.prev = id;
        write_page_header(store, free_list.first, old_head)?;
    }
    free_list.first = id;
    if free_list.last == 0 {
        free_list.last = id;
    }
    header.set_list(PageType::Free, free_list);
    write_page_header(store, id, freed)?;

    store.write_header(&header)?;
    trace!("freed {} page {}", ty, id);
    Ok(())
}

/// Returns the first page of a type's list.
pub fn first(store: &mut BlockStore, ty: PageType) -> Result<Option<BlockId>> {
    let header = store.read_header()?;
    let first = header.list(ty).first;
    Ok(if first == 0 { None } else { Some(first) })
}

/// Returns the last page of a type's list.
pub fn last(store: &mut BlockStore, ty: PageType) -> Result<Option<BlockId>> {
    let header = store.read_header()?;
    let last = header.list(ty).last;
    Ok(if last == 0 { None } else { Some(last) })
}

/// Returns the page following `id` in its list.
pub fn next(store: &mut BlockStore, id: BlockId) -> Result<Option<BlockId>> {
    let header = read_page_header(store, id)?;
    Ok(if header.next == 0 {
        None
    } else {
        Some(header.next)
    })
}

/// Returns the page preceding `id` in its list.
pub fn prev(store: &mut BlockStore, id: BlockId) -> Result<Option<BlockId>> {
    let header = read_page_header(store, id)?;
    Ok(if header.prev == 0 {
        None
    } else {
        Some(header.prev)
    })
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

    fn collect(store: &mut BlockStore, ty: PageType) -> Vec<BlockId> {
        let mut ids = Vec::new();
        let mut cursor = first(store, ty).unwrap();
        while let Some(id) = cursor {
            ids.push(id);
            cursor = next(store, id).unwrap();
        }
        ids
    }

    #[test]
    fn test_allocate_links_at_tail() {
        let (mut store, _dir) = create_test_store();

        let a = allocate(&mut store, PageType::Data).unwrap();
        let b = allocate(&mut store, PageType::Data).unwrap();
        let c = allocate(&mut store, PageType::Data).unwrap();

        assert_eq!(collect(&mut store, PageType::Data), vec![a, b, c]);
        assert_eq!(first(&mut store, PageType::Data).unwrap(), Some(a));
        assert_eq!(last(&mut store, PageType::Data).unwrap(), Some(c));
        assert_eq!(prev(&mut store, b).unwrap(), Some(a));
        assert_eq!(next(&mut store, b).unwrap(), Some(c));
    }

    #[test]
    fn test_allocate_free_type_is_fatal() {
        let (mut store, _dir) = create_test_store();
        let result = allocate(&mut store, PageType::Free);
        assert!(matches!(result, Err(VellumError::Internal(_))));
    }

    #[test]
    fn test_free_middle_page_relinks_neighbors() {
        let (mut store, _dir) = create_test_store();

        let a = allocate(&mut store, PageType::Data).unwrap();
        let b = allocate(&mut store, PageType::Data).unwrap();
        let c = allocate(&mut store, PageType::Data).unwrap();

        free(&mut store, PageType::Data, b).unwrap();

        assert_eq!(collect(&mut store, PageType::Data), vec![a, c]);
        assert_eq!(next(&mut store, a).unwrap(), Some(c));
        assert_eq!(prev(&mut store, c).unwrap(), Some(a));
        assert_eq!(collect(&mut store, PageType::Free), vec![b]);
    }

    #[test]
    fn test_freed_page_is_reused() {
        let (mut store, _dir) = create_test_store();

        let a = allocate(&mut store, PageType::Data).unwrap();
        free(&mut store, PageType::Data, a).unwrap();

        // The next allocation of any type must pop the free list instead
        // of extending the file.
        let b = allocate(&mut store, PageType::Translation).unwrap();
        assert_eq!(b, a);
        assert!(collect(&mut store, PageType::Free).is_empty());
        assert_eq!(collect(&mut store, PageType::Translation), vec![b]);
    }

    #[test]
    fn test_free_wrong_type_is_error() {
        let (mut store, _dir) = create_test_store();

        let a = allocate(&mut store, PageType::Data).unwrap();
        let result = free(&mut store, PageType::Translation, a);
        assert!(matches!(
            result,
            Err(VellumError::PageTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_reused_page_body_is_zeroed() {
        let (mut store, _dir) = create_test_store();

        let a = allocate(&mut store, PageType::Data).unwrap();
        let mut block = store.get(a).unwrap();
        block.data_mut()[100] = 0xFF;
        store.release(block, true).unwrap();

        free(&mut store, PageType::Data, a).unwrap();
        let b = allocate(&mut store, PageType::Data).unwrap();
        assert_eq!(b, a);

        let block = store.get(b).unwrap();
        assert_eq!(block.data()[100], 0);
        store.release(block, false).unwrap();
    }

    #[test]
    fn test_lists_are_independent() {
        let (mut store, _dir) = create_test_store();

        let d = allocate(&mut store, PageType::Data).unwrap();
        let t = allocate(&mut store, PageType::Translation).unwrap();
        let l = allocate(&mut store, PageType::FreeLogicalIds).unwrap();

        assert_eq!(collect(&mut store, PageType::Data), vec![d]);
        assert_eq!(collect(&mut store, PageType::Translation), vec![t]);
        assert_eq!(collect(&mut store, PageType::FreeLogicalIds), vec![l]);
        assert_eq!(collect(&mut store, PageType::FreePhysicalIds), Vec::<BlockId>::new());
    }

    #[test]
    fn test_page_header_roundtrip() {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        let header = PageHeader {
            page_type: PageType::Translation,
            prev: 11,
            next: 22,
        };
        header.write_to(&mut buf);
        let parsed = PageHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_page_header_rejects_zeroed_block() {
        let buf = [0u8; PAGE_HEADER_SIZE];
        assert!(PageHeader::from_bytes(&buf).is_err());
    }
}
