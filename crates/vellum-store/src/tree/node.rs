//! B+Tree node records and their serialized form.
//!
//! Nodes are ordinary records: the tree reads and rewrites them through
//! the record manager, which keeps node ids stable across size changes.
//!
//! Serialized layout:
//! - leaf: tag 1, prev id (8), next id (8), entry count (2), then per
//!   entry a length-prefixed key (u16) and value (u32)
//! - internal: tag 2, key count (2), length-prefixed keys, then
//!   count + 1 child ids (8 each)

use bytes::{Buf, BufMut};
use vellum_common::{RecordId, Result, Serializer, VellumError};

const TAG_LEAF: u8 = 1;
const TAG_INTERNAL: u8 = 2;

/// A leaf node: sorted entries plus the sibling chain for cursors.
#[derive(Debug, Clone)]
pub struct LeafNode<K, V> {
    /// Previous leaf in key order (invalid id = leftmost).
    pub prev: RecordId,
    /// Next leaf in key order (invalid id = rightmost).
    pub next: RecordId,
    /// Sorted keys.
    pub keys: Vec<K>,
    /// Values, parallel to `keys`.
    pub values: Vec<V>,
}

/// An internal node: separator keys and child pointers.
///
/// `children[i]` holds keys strictly below `keys[i]`; the last child holds
/// the rest. Separators are the smallest key of the child to their right.
#[derive(Debug, Clone)]
pub struct InternalNode<K> {
    /// Separator keys.
    pub keys: Vec<K>,
    /// Child node ids; always `keys.len() + 1` entries.
    pub children: Vec<RecordId>,
}

/// A decoded tree node.
#[derive(Debug, Clone)]
pub enum Node<K, V> {
    /// Leaf level.
    Leaf(LeafNode<K, V>),
    /// Internal level.
    Internal(InternalNode<K>),
}

impl<K, V> Node<K, V> {
    /// Serializes the node.
    pub fn encode(
        &self,
        key_ser: &dyn Serializer<K>,
        val_ser: &dyn Serializer<V>,
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut scratch = Vec::new();
        match self {
            Node::Leaf(leaf) => {
                buf.put_u8(TAG_LEAF);
                buf.put_u64_le(leaf.prev.0);
                buf.put_u64_le(leaf.next.0);
                buf.put_u16_le(leaf.keys.len() as u16);
                for (key, value) in leaf.keys.iter().zip(leaf.values.iter()) {
                    scratch.clear();
                    key_ser.serialize(key, &mut scratch)?;
                    buf.put_u16_le(scratch.len() as u16);
                    buf.put_slice(&scratch);

                    scratch.clear();
                    val_ser.serialize(value, &mut scratch)?;
                    buf.put_u32_le(scratch.len() as u32);
                    buf.put_slice(&scratch);
                }
            }
            Node::Internal(node) => {
                buf.put_u8(TAG_INTERNAL);
                buf.put_u16_le(node.keys.len() as u16);
                for key in &node.keys {
                    scratch.clear();
                    key_ser.serialize(key, &mut scratch)?;
                    buf.put_u16_le(scratch.len() as u16);
                    buf.put_slice(&scratch);
                }
                for child in &node.children {
                    buf.put_u64_le(child.0);
                }
            }
        }
        Ok(buf)
    }

    /// Deserializes a node.
    pub fn decode(
        mut data: &[u8],
        key_ser: &dyn Serializer<K>,
        val_ser: &dyn Serializer<V>,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(VellumError::Corrupted {
                reason: "empty tree node record".to_string(),
            });
        }
        let tag = data.get_u8();
        match tag {
            TAG_LEAF => {
                if data.len() < 18 {
                    return Err(truncated());
                }
                let prev = RecordId(data.get_u64_le());
                let next = RecordId(data.get_u64_le());
                let count = data.get_u16_le() as usize;
                let mut keys = Vec::with_capacity(count);
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    if data.len() < 2 {
                        return Err(truncated());
                    }
                    let key_len = data.get_u16_le() as usize;
                    if data.len() < key_len {
                        return Err(truncated());
                    }
                    keys.push(key_ser.deserialize(&data[..key_len])?);
                    data.advance(key_len);

                    if data.len() < 4 {
                        return Err(truncated());
                    }
                    let val_len = data.get_u32_le() as usize;
                    if data.len() < val_len {
                        return Err(truncated());
                    }
                    values.push(val_ser.deserialize(&data[..val_len])?);
                    data.advance(val_len);
                }
                Ok(Node::Leaf(LeafNode {
                    prev,
                    next,
                    keys,
                    values,
                }))
            }
            TAG_INTERNAL => {
                if data.len() < 2 {
                    return Err(truncated());
                }
                let count = data.get_u16_le() as usize;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    if data.len() < 2 {
                        return Err(truncated());
                    }
                    let key_len = data.get_u16_le() as usize;
                    if data.len() < key_len {
                        return Err(truncated());
                    }
                    keys.push(key_ser.deserialize(&data[..key_len])?);
                    data.advance(key_len);
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..count + 1 {
                    if data.len() < 8 {
                        return Err(truncated());
                    }
                    children.push(RecordId(data.get_u64_le()));
                }
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            _ => Err(VellumError::Corrupted {
                reason: format!("invalid tree node tag: {}", tag),
            }),
        }
    }
}

fn truncated() -> VellumError {
    VellumError::Corrupted {
        reason: "truncated tree node record".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_common::{StringSerializer, U64Serializer};

    #[test]
    fn test_leaf_roundtrip() {
        let leaf: Node<String, u64> = Node::Leaf(LeafNode {
            prev: RecordId(5),
            next: RecordId(9),
            keys: vec!["alpha".to_string(), "beta".to_string()],
            values: vec![1, 2],
        });
        let encoded = leaf.encode(&StringSerializer, &U64Serializer).unwrap();
        let decoded = Node::decode(&encoded, &StringSerializer, &U64Serializer).unwrap();

        match decoded {
            Node::Leaf(l) => {
                assert_eq!(l.prev, RecordId(5));
                assert_eq!(l.next, RecordId(9));
                assert_eq!(l.keys, vec!["alpha", "beta"]);
                assert_eq!(l.values, vec![1, 2]);
            }
            Node::Internal(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_internal_roundtrip() {
        let node: Node<u64, u64> = Node::Internal(InternalNode {
            keys: vec![10, 20],
            children: vec![RecordId(1), RecordId(2), RecordId(3)],
        });
        let encoded = node.encode(&U64Serializer, &U64Serializer).unwrap();
        let decoded = Node::decode(&encoded, &U64Serializer, &U64Serializer).unwrap();

        match decoded {
            Node::Internal(n) => {
                assert_eq!(n.keys, vec![10, 20]);
                assert_eq!(n.children, vec![RecordId(1), RecordId(2), RecordId(3)]);
            }
            Node::Leaf(_) => panic!("expected internal"),
        }
    }

    #[test]
    fn test_empty_leaf_roundtrip() {
        let leaf: Node<u64, u64> = Node::Leaf(LeafNode {
            prev: RecordId::INVALID,
            next: RecordId::INVALID,
            keys: Vec::new(),
            values: Vec::new(),
        });
        let encoded = leaf.encode(&U64Serializer, &U64Serializer).unwrap();
        let decoded = Node::decode(&encoded, &U64Serializer, &U64Serializer).unwrap();
        match decoded {
            Node::Leaf(l) => assert!(l.keys.is_empty()),
            Node::Internal(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<Node<u64, u64>> =
            Node::decode(&[99, 1, 2, 3], &U64Serializer, &U64Serializer);
        assert!(matches!(result, Err(VellumError::Corrupted { .. })));

        let result: Result<Node<u64, u64>> =
            Node::decode(&[], &U64Serializer, &U64Serializer);
        assert!(result.is_err());
    }
}
