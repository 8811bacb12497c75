//! The record manager interface.
//!
//! This is the narrow surface the layers above consume: insert, update,
//! fetch, and delete by logical id; named roots for bootstrapping; and
//! commit/rollback. The byte-oriented methods are the object-safe core;
//! the generic helpers bolt pluggable serialization on top.

use std::sync::Arc;
use vellum_common::{RecordId, Result, Serializer};

/// Transactional record storage keyed by stable logical ids.
pub trait RecordManager: Send + Sync {
    /// Stores a new record and returns its logical id.
    fn insert_bytes(&self, data: &[u8]) -> Result<RecordId>;

    /// Rewrites an existing record. The id stays valid even when the
    /// record is physically relocated.
    fn update_bytes(&self, id: RecordId, data: &[u8]) -> Result<()>;

    /// Reads a record back.
    fn fetch_bytes(&self, id: RecordId) -> Result<Vec<u8>>;

    /// Deletes a record, retiring its id for reuse.
    fn delete(&self, id: RecordId) -> Result<()>;

    /// Reads a root slot.
    fn get_root(&self, slot: usize) -> Result<RecordId>;

    /// Writes a root slot.
    fn set_root(&self, slot: usize, id: RecordId) -> Result<()>;

    /// Looks up a named object; `None` when the name is unregistered.
    fn get_named(&self, name: &str) -> Result<Option<RecordId>>;

    /// Registers a named object; `None` unregisters the name.
    fn set_named(&self, name: &str, id: Option<RecordId>) -> Result<()>;

    /// Makes all changes since the last commit durable.
    fn commit(&self) -> Result<()>;

    /// Discards all changes since the last commit.
    fn rollback(&self) -> Result<()>;

    /// Shuts the manager down. Any operation afterwards fails fast.
    fn close(&self) -> Result<()>;

    /// Stores a value through a serializer.
    fn insert<T>(&self, value: &T, serializer: &dyn Serializer<T>) -> Result<RecordId>
    where
        Self: Sized,
    {
        let mut buf = Vec::new();
        serializer.serialize(value, &mut buf)?;
        self.insert_bytes(&buf)
    }

    /// Rewrites a value through a serializer.
    fn update<T>(&self, id: RecordId, value: &T, serializer: &dyn Serializer<T>) -> Result<()>
    where
        Self: Sized,
    {
        let mut buf = Vec::new();
        serializer.serialize(value, &mut buf)?;
        self.update_bytes(id, &buf)
    }

    /// Reads a value through a serializer.
    fn fetch<T>(&self, id: RecordId, serializer: &dyn Serializer<T>) -> Result<T>
    where
        Self: Sized,
    {
        serializer.deserialize(&self.fetch_bytes(id)?)
    }
}

impl<M: RecordManager + ?Sized> RecordManager for Arc<M> {
    fn insert_bytes(&self, data: &[u8]) -> Result<RecordId> {
        (**self).insert_bytes(data)
    }

    fn update_bytes(&self, id: RecordId, data: &[u8]) -> Result<()> {
        (**self).update_bytes(id, data)
    }

    fn fetch_bytes(&self, id: RecordId) -> Result<Vec<u8>> {
        (**self).fetch_bytes(id)
    }

    fn delete(&self, id: RecordId) -> Result<()> {
        (**self).delete(id)
    }

    fn get_root(&self, slot: usize) -> Result<RecordId> {
        (**self).get_root(slot)
    }

    fn set_root(&self, slot: usize, id: RecordId) -> Result<()> {
        (**self).set_root(slot, id)
    }

    fn get_named(&self, name: &str) -> Result<Option<RecordId>> {
        (**self).get_named(name)
    }

    fn set_named(&self, name: &str, id: Option<RecordId>) -> Result<()> {
        (**self).set_named(name, id)
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}
