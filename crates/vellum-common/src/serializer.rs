//! Pluggable serialization for application objects.
//!
//! Record managers and tables store opaque byte sequences; a [`Serializer`]
//! converts application values to and from those bytes. Implementations are
//! object-safe so callers can hold them behind `Arc<dyn Serializer<T>>`.

use crate::error::{Result, VellumError};

/// Converts values of type `T` to and from their stored byte form.
pub trait Serializer<T>: Send + Sync {
    /// Appends the serialized form of `value` to `buf`.
    fn serialize(&self, value: &T, buf: &mut Vec<u8>) -> Result<()>;

    /// Reconstructs a value from its serialized form.
    fn deserialize(&self, data: &[u8]) -> Result<T>;
}

/// Identity serializer for raw byte arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteArraySerializer;

impl Serializer<Vec<u8>> for ByteArraySerializer {
    fn serialize(&self, value: &Vec<u8>, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(value);
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// UTF-8 string serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> Result<String> {
        String::from_utf8(data.to_vec())
            .map_err(|e| VellumError::DeserializeFailed(format!("invalid utf-8: {}", e)))
    }
}

/// Little-endian u64 serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn serialize(&self, value: &u64, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| VellumError::DeserializeFailed(format!("expected 8 bytes, got {}", data.len())))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Serializer for the unit type: zero bytes on disk.
///
/// Used as the payload serializer for trees whose keys carry all the
/// information, e.g. secondary duplicate-value trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitSerializer;

impl Serializer<()> for UnitSerializer {
    fn serialize(&self, _value: &(), _buf: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> Result<()> {
        if !data.is_empty() {
            return Err(VellumError::DeserializeFailed(format!(
                "expected 0 bytes, got {}",
                data.len()
            )));
        }
        Ok(())
    }
}
