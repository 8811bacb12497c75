//! Duplicate-value storage for tables.
//!
//! A duplicate-mode table stores one [`DuplicateContainer`] per key: a
//! sorted in-memory set of values serialized whole, or, once the set
//! outgrows the table's duplicate limit, a redirect to a secondary
//! B+Tree whose keys are the values themselves. A key is always in
//! exactly one of the two representations; decoding anything else is a
//! fatal illegal-state.

use bytes::{Buf, BufMut};
use std::sync::Arc;
use vellum_common::{RecordId, Result, Serializer, VellumError};

const TAG_VALUES: u8 = 0;
const TAG_REDIRECT: u8 = 1;

/// Per-key value storage of a duplicate-mode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateContainer<V> {
    /// Sorted values, serialized as part of the leaf entry.
    Values(Vec<V>),
    /// Id of the secondary tree holding this key's values as keys.
    Redirect(RecordId),
}

/// Serializer for [`DuplicateContainer`], delegating element encoding to
/// the table's value serializer.
pub struct ContainerSerializer<V> {
    inner: Arc<dyn Serializer<V>>,
}

impl<V> ContainerSerializer<V> {
    /// Wraps a value serializer.
    pub fn new(inner: Arc<dyn Serializer<V>>) -> Self {
        Self { inner }
    }
}

impl<V> Serializer<DuplicateContainer<V>> for ContainerSerializer<V> {
    fn serialize(&self, value: &DuplicateContainer<V>, buf: &mut Vec<u8>) -> Result<()> {
        match value {
            DuplicateContainer::Values(values) => {
                buf.put_u8(TAG_VALUES);
                buf.put_u32_le(values.len() as u32);
                let mut scratch = Vec::new();
                for v in values {
                    scratch.clear();
                    self.inner.serialize(v, &mut scratch)?;
                    buf.put_u32_le(scratch.len() as u32);
                    buf.put_slice(&scratch);
                }
            }
            DuplicateContainer::Redirect(id) => {
                buf.put_u8(TAG_REDIRECT);
                buf.put_u64_le(id.0);
            }
        }
        Ok(())
    }

    fn deserialize(&self, mut data: &[u8]) -> Result<DuplicateContainer<V>> {
        if data.is_empty() {
            return Err(VellumError::IllegalState(
                "empty duplicate container".to_string(),
            ));
        }
        match data.get_u8() {
            TAG_VALUES => {
                if data.len() < 4 {
                    return Err(truncated());
                }
                let count = data.get_u32_le() as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    if data.len() < 4 {
                        return Err(truncated());
                    }
                    let len = data.get_u32_le() as usize;
                    if data.len() < len {
                        return Err(truncated());
                    }
                    values.push(self.inner.deserialize(&data[..len])?);
                    data.advance(len);
                }
                Ok(DuplicateContainer::Values(values))
            }
            TAG_REDIRECT => {
                if data.len() < 8 {
                    return Err(truncated());
                }
                Ok(DuplicateContainer::Redirect(RecordId(data.get_u64_le())))
            }
            tag => Err(VellumError::IllegalState(format!(
                "duplicate container is neither a value set nor a redirect (tag {})",
                tag
            ))),
        }
    }
}

fn truncated() -> VellumError {
    VellumError::DeserializeFailed("truncated duplicate container".to_string())
}
