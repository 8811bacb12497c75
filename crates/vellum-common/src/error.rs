//! Error types for Vellum.

use thiserror::Error;

/// Result type alias using VellumError.
pub type Result<T> = std::result::Result<T, VellumError>;

/// Errors that can occur in Vellum operations.
#[derive(Debug, Error)]
pub enum VellumError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted store: {reason}")]
    Corrupted { reason: String },

    // Block store errors
    #[error("Block {block} is already checked out")]
    BlockInUse { block: u64 },

    #[error("Block {block} was not checked out")]
    BlockNotInUse { block: u64 },

    #[error("Block pool '{pool}' not empty at close: {count} blocks")]
    PoolNotEmpty { pool: &'static str, count: usize },

    // Page manager errors
    #[error("Invalid page operation: {0}")]
    InvalidPageOperation(String),

    #[error("Page {block} type mismatch: expected {expected}, got {actual}")]
    PageTypeMismatch { block: u64, expected: u8, actual: u8 },

    // Record manager errors
    #[error("Invalid record id: {id}")]
    InvalidRecordId { id: u64 },

    #[error("Record not found: {id}")]
    RecordNotFound { id: u64 },

    #[error("Record manager is closed")]
    StoreClosed,

    #[error("Root slot {slot} out of range (max {max})")]
    RootSlotOutOfRange { slot: usize, max: usize },

    // Transaction log errors
    #[error("Transaction log corrupted: {reason}")]
    LogCorrupted { reason: String },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    // Serialization errors
    #[error("Serialization failed: {0}")]
    SerializeFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializeFailed(String),

    // Table errors
    #[error("Illegal table state: {0}")]
    IllegalState(String),

    #[error("Cursor is not positioned on a tuple")]
    CursorNotPositioned,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
