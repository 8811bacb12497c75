//! Generic B+Tree persisted through a record manager.
//!
//! Keys and values are serialized with pluggable [`Serializer`]s and
//! ordered by a caller-supplied comparator. Tree metadata (root id,
//! height, entry count, order) is its own record; that record's id is the
//! tree's identity and is what the named object directory points at.
//!
//! Inserts split full nodes upward; deletes borrow from siblings, merge,
//! and collapse the root, keeping all leaves at the same depth.

mod node;

pub mod cursor;

pub use cursor::TreeCursor;
pub use node::{InternalNode, LeafNode, Node};

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use vellum_common::{RecordId, Result, Serializer, VellumError};

use crate::manager::RecordManager;

/// Ordering function shared by a tree and its cursors.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Comparator backed by the type's `Ord` instance.
pub fn ord_comparator<T: Ord>() -> Comparator<T> {
    Arc::new(|a: &T, b: &T| a.cmp(b))
}

/// Default maximum entries per node.
pub const DEFAULT_ORDER: usize = 32;

/// Smallest usable order.
pub const MIN_ORDER: usize = 4;

const META_SIZE: usize = 24;

#[derive(Debug, Clone, Copy)]
struct TreeMeta {
    root: RecordId,
    height: u32,
    order: u32,
    len: u64,
}

impl TreeMeta {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_SIZE);
        buf.put_u64_le(self.root.0);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.order);
        buf.put_u64_le(self.len);
        buf
    }

    fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() != META_SIZE {
            return Err(VellumError::Corrupted {
                reason: format!("tree meta record has {} bytes, expected {}", data.len(), META_SIZE),
            });
        }
        Ok(Self {
            root: RecordId(data.get_u64_le()),
            height: data.get_u32_le(),
            order: data.get_u32_le(),
            len: data.get_u64_le(),
        })
    }
}

struct InsertOutcome<K, V> {
    previous: Option<V>,
    inserted: bool,
    split: Option<(K, RecordId)>,
}

/// An ordered key/value tree stored as records.
pub struct BTree<K, V, M> {
    rec: M,
    id: RecordId,
    key_ser: Arc<dyn Serializer<K>>,
    val_ser: Arc<dyn Serializer<V>>,
    cmp: Comparator<K>,
    meta: Mutex<TreeMeta>,
}

impl<K, V, M> BTree<K, V, M>
where
    K: Clone,
    V: Clone,
    M: RecordManager,
{
    /// Creates an empty tree and persists its meta record.
    pub fn create(
        rec: M,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
        cmp: Comparator<K>,
        order: usize,
    ) -> Result<Self> {
        if order < MIN_ORDER {
            return Err(VellumError::Internal(format!(
                "tree order {} below minimum {}",
                order, MIN_ORDER
            )));
        }
        let meta = TreeMeta {
            root: RecordId::INVALID,
            height: 0,
            order: order as u32,
            len: 0,
        };
        let id = rec.insert_bytes(&meta.encode())?;
        Ok(Self {
            rec,
            id,
            key_ser,
            val_ser,
            cmp,
            meta: Mutex::new(meta),
        })
    }

    /// Loads an existing tree from its meta record.
    pub fn load(
        rec: M,
        id: RecordId,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
        cmp: Comparator<K>,
    ) -> Result<Self> {
        let meta = TreeMeta::decode(&rec.fetch_bytes(id)?)?;
        Ok(Self {
            rec,
            id,
            key_ser,
            val_ser,
            cmp,
            meta: Mutex::new(meta),
        })
    }

    /// Returns the id of the tree's meta record.
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Returns the number of entries.
    pub fn len(&self) -> u64 {
        self.meta.lock().len
    }

    /// Returns true when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the tree's comparator.
    pub fn comparator(&self) -> Comparator<K> {
        Arc::clone(&self.cmp)
    }

    /// Inserts a key/value pair.
    ///
    /// When the key exists, the stored value is returned; it is replaced
    /// only if `replace` is set.
    pub fn insert(&self, key: K, value: V, replace: bool) -> Result<Option<V>> {
        let mut meta = self.meta.lock();

        if !meta.root.is_valid() {
            let leaf = LeafNode {
                prev: RecordId::INVALID,
                next: RecordId::INVALID,
                keys: vec![key],
                values: vec![value],
            };
            meta.root = self.store_new(&Node::Leaf(leaf))?;
            meta.height = 1;
            meta.len = 1;
            self.save_meta(&meta)?;
            return Ok(None);
        }

        let order = meta.order as usize;
        let outcome = self.insert_into(meta.root, key, value, replace, order)?;
        let mut changed = false;
        if let Some((sep, right_id)) = outcome.split {
            let new_root = InternalNode {
                keys: vec![sep],
                children: vec![meta.root, right_id],
            };
            meta.root = self.store_new(&Node::Internal(new_root))?;
            meta.height += 1;
            changed = true;
        }
        if outcome.inserted {
            meta.len += 1;
            changed = true;
        }
        if changed {
            self.save_meta(&meta)?;
        }
        Ok(outcome.previous)
    }

    /// Looks up a key.
    pub fn find(&self, key: &K) -> Result<Option<V>> {
        let meta = *self.meta.lock();
        if !meta.root.is_valid() {
            return Ok(None);
        }

        let mut node_id = meta.root;
        loop {
            match self.load_node(node_id)? {
                Node::Internal(n) => {
                    node_id = n.children[self.route(&n.keys, key)];
                }
                Node::Leaf(mut n) => {
                    return Ok(match self.search(&n.keys, key) {
                        Ok(i) => Some(n.values.remove(i)),
                        Err(_) => None,
                    });
                }
            }
        }
    }

    /// Returns the smallest entry.
    pub fn first(&self) -> Result<Option<(K, V)>> {
        match self.first_leaf()? {
            Some(id) => {
                let mut leaf = self.load_leaf(id)?;
                if leaf.keys.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some((leaf.keys.remove(0), leaf.values.remove(0))))
                }
            }
            None => Ok(None),
        }
    }

    /// Removes a key, returning the value it held.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let mut meta = self.meta.lock();
        if !meta.root.is_valid() {
            return Ok(None);
        }

        let order = meta.order as usize;
        let (removed, _) = self.remove_from(meta.root, key, order)?;
        if removed.is_none() {
            return Ok(None);
        }
        meta.len -= 1;

        // Collapse a root that lost its purpose.
        loop {
            match self.load_node(meta.root)? {
                Node::Internal(n) if n.keys.is_empty() => {
                    let only_child = n.children[0];
                    self.rec.delete(meta.root)?;
                    meta.root = only_child;
                    meta.height -= 1;
                }
                Node::Leaf(n) if n.keys.is_empty() => {
                    self.rec.delete(meta.root)?;
                    meta.root = RecordId::INVALID;
                    meta.height = 0;
                    break;
                }
                _ => break,
            }
        }
        self.save_meta(&meta)?;
        Ok(removed)
    }

    /// Deletes every node, leaving an empty tree.
    pub fn clear(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        if meta.root.is_valid() {
            self.delete_subtree(meta.root)?;
        }
        meta.root = RecordId::INVALID;
        meta.height = 0;
        meta.len = 0;
        self.save_meta(&meta)
    }

    /// Deletes every node and the meta record itself.
    ///
    /// The handle must not be used afterwards.
    pub fn destroy(&self) -> Result<()> {
        self.clear()?;
        self.rec.delete(self.id)
    }

    /// Opens a cursor over this tree.
    pub fn cursor(self: &Arc<Self>) -> TreeCursor<K, V, M> {
        TreeCursor::new(Arc::clone(self))
    }

    // ------------------------------------------------------------------
    // Internal operations
    // ------------------------------------------------------------------

    fn min_entries(&self, order: usize) -> usize {
        order / 2
    }

    /// Index of the child to descend into for `key`.
    fn route(&self, keys: &[K], key: &K) -> usize {
        keys.partition_point(|sep| (self.cmp)(sep, key) != Ordering::Greater)
    }

    /// Binary search within a node's keys.
    fn search(&self, keys: &[K], key: &K) -> std::result::Result<usize, usize> {
        keys.binary_search_by(|probe| (self.cmp)(probe, key))
    }

    fn insert_into(
        &self,
        node_id: RecordId,
        key: K,
        value: V,
        replace: bool,
        order: usize,
    ) -> Result<InsertOutcome<K, V>> {
        match self.load_node(node_id)? {
            Node::Internal(mut n) => {
                let idx = self.route(&n.keys, &key);
                let outcome = self.insert_into(n.children[idx], key, value, replace, order)?;

                let split = if let Some((sep, right_id)) = outcome.split {
                    n.keys.insert(idx, sep);
                    n.children.insert(idx + 1, right_id);
                    let split = if n.keys.len() > order {
                        let mid = n.keys.len() / 2;
                        let right_keys = n.keys.split_off(mid + 1);
                        let up = n.keys.pop().expect("separator at mid");
                        let right_children = n.children.split_off(mid + 1);
                        let right = InternalNode {
                            keys: right_keys,
                            children: right_children,
                        };
                        let right_id = self.store_new(&Node::Internal(right))?;
                        Some((up, right_id))
                    } else {
                        None
                    };
                    self.store(node_id, &Node::Internal(n))?;
                    split
                } else {
                    None
                };

                Ok(InsertOutcome {
                    previous: outcome.previous,
                    inserted: outcome.inserted,
                    split,
                })
            }
            Node::Leaf(mut n) => match self.search(&n.keys, &key) {
                Ok(i) => {
                    if replace {
                        let old = std::mem::replace(&mut n.values[i], value);
                        self.store(node_id, &Node::Leaf(n))?;
                        Ok(InsertOutcome {
                            previous: Some(old),
                            inserted: false,
                            split: None,
                        })
                    } else {
                        Ok(InsertOutcome {
                            previous: Some(n.values[i].clone()),
                            inserted: false,
                            split: None,
                        })
                    }
                }
                Err(i) => {
                    n.keys.insert(i, key);
                    n.values.insert(i, value);

                    let split = if n.keys.len() > order {
                        let mid = n.keys.len() / 2;
                        let right_keys = n.keys.split_off(mid);
                        let right_values = n.values.split_off(mid);
                        let sep = right_keys[0].clone();
                        let old_next = n.next;
                        let right = LeafNode {
                            prev: node_id,
                            next: old_next,
                            keys: right_keys,
                            values: right_values,
                        };
                        let right_id = self.store_new(&Node::Leaf(right))?;
                        if old_next.is_valid() {
                            let mut after = self.load_leaf(old_next)?;
                            after.prev = right_id;
                            self.store(old_next, &Node::Leaf(after))?;
                        }
                        n.next = right_id;
                        Some((sep, right_id))
                    } else {
                        None
                    };

                    self.store(node_id, &Node::Leaf(n))?;
                    Ok(InsertOutcome {
                        previous: None,
                        inserted: true,
                        split,
                    })
                }
            },
        }
    }

    fn remove_from(
        &self,
        node_id: RecordId,
        key: &K,
        order: usize,
    ) -> Result<(Option<V>, bool)> {
        match self.load_node(node_id)? {
            Node::Leaf(mut n) => match self.search(&n.keys, key) {
                Ok(i) => {
                    n.keys.remove(i);
                    let removed = n.values.remove(i);
                    let underflow = n.keys.len() < self.min_entries(order);
                    self.store(node_id, &Node::Leaf(n))?;
                    Ok((Some(removed), underflow))
                }
                Err(_) => Ok((None, false)),
            },
            Node::Internal(mut n) => {
                let idx = self.route(&n.keys, key);
                let (removed, child_underflow) =
                    self.remove_from(n.children[idx], key, order)?;
                if removed.is_none() {
                    return Ok((None, false));
                }
                if child_underflow {
                    self.rebalance_child(&mut n, idx, order)?;
                    let underflow = n.keys.len() < self.min_entries(order);
                    self.store(node_id, &Node::Internal(n))?;
                    Ok((removed, underflow))
                } else {
                    Ok((removed, false))
                }
            }
        }
    }

    /// Fixes an underfull child by borrowing from a sibling or merging.
    fn rebalance_child(
        &self,
        parent: &mut InternalNode<K>,
        idx: usize,
        order: usize,
    ) -> Result<()> {
        let min = self.min_entries(order);

        if idx > 0 && self.entry_count(parent.children[idx - 1])? > min {
            return self.borrow_from_left(parent, idx);
        }
        if idx + 1 < parent.children.len() && self.entry_count(parent.children[idx + 1])? > min
        {
            return self.borrow_from_right(parent, idx);
        }
        if idx > 0 {
            self.merge_children(parent, idx - 1)
        } else {
            self.merge_children(parent, idx)
        }
    }

    fn borrow_from_left(&self, parent: &mut InternalNode<K>, idx: usize) -> Result<()> {
        let left_id = parent.children[idx - 1];
        let child_id = parent.children[idx];
        match (self.load_node(left_id)?, self.load_node(child_id)?) {
            (Node::Leaf(mut left), Node::Leaf(mut child)) => {
                let key = left.keys.pop().expect("left sibling non-empty");
                let value = left.values.pop().expect("left sibling non-empty");
                child.keys.insert(0, key);
                child.values.insert(0, value);
                parent.keys[idx - 1] = child.keys[0].clone();
                self.store(left_id, &Node::Leaf(left))?;
                self.store(child_id, &Node::Leaf(child))
            }
            (Node::Internal(mut left), Node::Internal(mut child)) => {
                let up = left.keys.pop().expect("left sibling non-empty");
                let down = std::mem::replace(&mut parent.keys[idx - 1], up);
                child.keys.insert(0, down);
                child
                    .children
                    .insert(0, left.children.pop().expect("left sibling non-empty"));
                self.store(left_id, &Node::Internal(left))?;
                self.store(child_id, &Node::Internal(child))
            }
            _ => Err(sibling_mismatch()),
        }
    }

    fn borrow_from_right(&self, parent: &mut InternalNode<K>, idx: usize) -> Result<()> {
        let child_id = parent.children[idx];
        let right_id = parent.children[idx + 1];
        match (self.load_node(child_id)?, self.load_node(right_id)?) {
            (Node::Leaf(mut child), Node::Leaf(mut right)) => {
                child.keys.push(right.keys.remove(0));
                child.values.push(right.values.remove(0));
                parent.keys[idx] = right.keys[0].clone();
                self.store(child_id, &Node::Leaf(child))?;
                self.store(right_id, &Node::Leaf(right))
            }
            (Node::Internal(mut child), Node::Internal(mut right)) => {
                let up = right.keys.remove(0);
                let down = std::mem::replace(&mut parent.keys[idx], up);
                child.keys.push(down);
                child.children.push(right.children.remove(0));
                self.store(child_id, &Node::Internal(child))?;
                self.store(right_id, &Node::Internal(right))
            }
            _ => Err(sibling_mismatch()),
        }
    }

    /// Merges `children[left_idx + 1]` into `children[left_idx]`.
    fn merge_children(&self, parent: &mut InternalNode<K>, left_idx: usize) -> Result<()> {
        let left_id = parent.children[left_idx];
        let right_id = parent.children[left_idx + 1];
        let sep = parent.keys.remove(left_idx);
        parent.children.remove(left_idx + 1);

        match (self.load_node(left_id)?, self.load_node(right_id)?) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.keys.extend(right.keys);
                left.values.extend(right.values);
                left.next = right.next;
                if right.next.is_valid() {
                    let mut after = self.load_leaf(right.next)?;
                    after.prev = left_id;
                    self.store(right.next, &Node::Leaf(after))?;
                }
                self.store(left_id, &Node::Leaf(left))?;
                self.rec.delete(right_id)
            }
            (Node::Internal(mut left), Node::Internal(right)) => {
                left.keys.push(sep);
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                self.store(left_id, &Node::Internal(left))?;
                self.rec.delete(right_id)
            }
            _ => Err(sibling_mismatch()),
        }
    }

    fn entry_count(&self, node_id: RecordId) -> Result<usize> {
        Ok(match self.load_node(node_id)? {
            Node::Leaf(n) => n.keys.len(),
            Node::Internal(n) => n.keys.len(),
        })
    }

    fn delete_subtree(&self, node_id: RecordId) -> Result<()> {
        if let Node::Internal(n) = self.load_node(node_id)? {
            for child in n.children {
                self.delete_subtree(child)?;
            }
        }
        self.rec.delete(node_id)
    }

    // ------------------------------------------------------------------
    // Node and leaf access shared with cursors
    // ------------------------------------------------------------------

    fn load_node(&self, id: RecordId) -> Result<Node<K, V>> {
        Node::decode(
            &self.rec.fetch_bytes(id)?,
            &*self.key_ser,
            &*self.val_ser,
        )
    }

    fn store(&self, id: RecordId, node: &Node<K, V>) -> Result<()> {
        self.rec
            .update_bytes(id, &node.encode(&*self.key_ser, &*self.val_ser)?)
    }

    fn store_new(&self, node: &Node<K, V>) -> Result<RecordId> {
        self.rec
            .insert_bytes(&node.encode(&*self.key_ser, &*self.val_ser)?)
    }

    fn save_meta(&self, meta: &TreeMeta) -> Result<()> {
        self.rec.update_bytes(self.id, &meta.encode())
    }

    pub(crate) fn load_leaf(&self, id: RecordId) -> Result<LeafNode<K, V>> {
        match self.load_node(id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(VellumError::Corrupted {
                reason: format!("expected leaf node at {}", id),
            }),
        }
    }

    pub(crate) fn first_leaf(&self) -> Result<Option<RecordId>> {
        self.edge_leaf(true)
    }

    pub(crate) fn last_leaf(&self) -> Result<Option<RecordId>> {
        self.edge_leaf(false)
    }

    fn edge_leaf(&self, leftmost: bool) -> Result<Option<RecordId>> {
        let meta = *self.meta.lock();
        if !meta.root.is_valid() {
            return Ok(None);
        }
        let mut node_id = meta.root;
        loop {
            match self.load_node(node_id)? {
                Node::Internal(n) => {
                    node_id = if leftmost {
                        n.children[0]
                    } else {
                        *n.children.last().expect("internal node has children")
                    };
                }
                Node::Leaf(_) => return Ok(Some(node_id)),
            }
        }
    }

    /// Descends to the leaf that would hold `key`.
    pub(crate) fn leaf_for(&self, key: &K) -> Result<Option<(RecordId, LeafNode<K, V>)>> {
        let meta = *self.meta.lock();
        if !meta.root.is_valid() {
            return Ok(None);
        }
        let mut node_id = meta.root;
        loop {
            match self.load_node(node_id)? {
                Node::Internal(n) => {
                    node_id = n.children[self.route(&n.keys, key)];
                }
                Node::Leaf(leaf) => return Ok(Some((node_id, leaf))),
            }
        }
    }

    /// Binary search over a leaf with the tree's comparator, for cursors.
    pub(crate) fn search_leaf(
        &self,
        leaf: &LeafNode<K, V>,
        key: &K,
    ) -> std::result::Result<usize, usize> {
        self.search(&leaf.keys, key)
    }
}

fn sibling_mismatch() -> VellumError {
    VellumError::Corrupted {
        reason: "sibling node level mismatch during rebalance".to_string(),
    }
}
