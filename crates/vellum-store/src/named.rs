//! Named object directory: persistent string -> record id map.
//!
//! The directory is itself a record, reachable through root slot 0, and is
//! how callers bootstrap named structures (tables, trees) without fixed
//! ids. Serialized layout: entry count (u32), then per entry a
//! length-prefixed UTF-8 name (u16) and the record id (u64).

use bytes::{Buf, BufMut};
use std::collections::HashMap;
use vellum_common::{RecordId, Result, VellumError};

/// In-memory form of the named object directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameDirectory {
    entries: HashMap<String, RecordId>,
}

impl NameDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the record id registered under `name`.
    pub fn get(&self, name: &str) -> Option<RecordId> {
        self.entries.get(name).copied()
    }

    /// Registers `name`, or removes it when `id` is `None`.
    pub fn set(&mut self, name: &str, id: Option<RecordId>) {
        match id {
            Some(id) => {
                self.entries.insert(name.to_string(), id);
            }
            None => {
                self.entries.remove(name);
            }
        }
    }

    /// Returns the number of registered names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no names are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the directory.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.entries.len() * 24);
        buf.put_u32_le(self.entries.len() as u32);
        for (name, id) in &self.entries {
            buf.put_u16_le(name.len() as u16);
            buf.put_slice(name.as_bytes());
            buf.put_u64_le(id.0);
        }
        buf
    }

    /// Deserializes a directory.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(VellumError::DeserializeFailed(
                "name directory record too short".to_string(),
            ));
        }
        let count = data.get_u32_le() as usize;
        let mut entries = HashMap::with_capacity(count);
        for _ in 0..count {
            if data.len() < 2 {
                return Err(VellumError::DeserializeFailed(
                    "truncated name directory entry".to_string(),
                ));
            }
            let name_len = data.get_u16_le() as usize;
            if data.len() < name_len + 8 {
                return Err(VellumError::DeserializeFailed(
                    "truncated name directory entry".to_string(),
                ));
            }
            let name = String::from_utf8(data[..name_len].to_vec()).map_err(|e| {
                VellumError::DeserializeFailed(format!("invalid name in directory: {}", e))
            })?;
            data.advance(name_len);
            let id = RecordId(data.get_u64_le());
            entries.insert(name, id);
        }
        Ok(Self { entries })
    }
}
