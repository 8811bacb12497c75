//! Block, location, and record id types for Vellum storage.

use serde::{Deserialize, Serialize};

/// Size of a block in bytes (4 KB).
pub const BLOCK_SIZE: usize = 4096;

/// Identifier of a block within the data file.
///
/// Block 0 is always the file header; data blocks start at 1.
pub type BlockId = u64;

/// A physical location within the data file: a block id plus a byte
/// offset inside that block.
///
/// Locations identify either a physical record slot or, when packed into a
/// [`RecordId`], a slot in a translation page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Block containing the target.
    pub block: BlockId,
    /// Byte offset within the block.
    pub offset: u16,
}

impl Location {
    /// Creates a new location.
    pub fn new(block: BlockId, offset: u16) -> Self {
        Self { block, offset }
    }

    /// Returns the location as a single u64 for compact storage.
    ///
    /// The block id occupies the upper 48 bits, the offset the lower 16.
    pub fn as_u64(&self) -> u64 {
        (self.block << 16) | (self.offset as u64)
    }

    /// Creates a location from its u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            block: value >> 16,
            offset: value as u16,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block, self.offset)
    }
}

/// Stable logical identifier of a record.
///
/// A record id packs the block id of a translation page (upper 48 bits)
/// and a slot index within that page (lower 16 bits). The id indirects
/// through the translation slot to the record's current physical location,
/// so records can be relocated without invalidating the id.
///
/// Id 0 is invalid: translation pages never live in block 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct RecordId(pub u64);

impl RecordId {
    /// The invalid / absent record id.
    pub const INVALID: RecordId = RecordId(0);

    /// Creates a record id from a translation page block and slot index.
    pub fn new(block: BlockId, slot: u16) -> Self {
        Self((block << 16) | (slot as u64))
    }

    /// Returns the translation page block id.
    pub fn block(&self) -> BlockId {
        self.0 >> 16
    }

    /// Returns the slot index within the translation page.
    pub fn slot(&self) -> u16 {
        self.0 as u16
    }

    /// Returns true if this id refers to a record.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
