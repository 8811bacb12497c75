//! Bidirectional cursor over a B+Tree.
//!
//! The cursor carries an explicit position instead of "between tuples"
//! bookkeeping: it is before the first tuple, after the last, on a tuple,
//! or before a specific slot (the state `before`/`after` seeks produce).
//! Because the position is explicit, switching traversal direction needs
//! no compensation step.

use super::{BTree, LeafNode};
use crate::manager::RecordManager;
use std::sync::Arc;
use vellum_common::{RecordId, Result, VellumError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorPos {
    /// Before every tuple.
    BeforeFirst,
    /// Between tuples: the slot at (leaf, idx) is the next one forward.
    Before { leaf: RecordId, idx: usize },
    /// On the tuple at (leaf, idx).
    At { leaf: RecordId, idx: usize },
    /// After every tuple.
    AfterLast,
}

/// Cursor over `(key, value)` tuples in comparator order.
pub struct TreeCursor<K, V, M> {
    tree: Arc<BTree<K, V, M>>,
    pos: CursorPos,
}

impl<K, V, M> TreeCursor<K, V, M>
where
    K: Clone,
    V: Clone,
    M: RecordManager,
{
    pub(crate) fn new(tree: Arc<BTree<K, V, M>>) -> Self {
        Self {
            tree,
            pos: CursorPos::BeforeFirst,
        }
    }

    /// Positions before the first tuple.
    pub fn before_first(&mut self) {
        self.pos = CursorPos::BeforeFirst;
    }

    /// Positions after the last tuple.
    pub fn after_last(&mut self) {
        self.pos = CursorPos::AfterLast;
    }

    /// Positions just before the first tuple whose key is >= `key`.
    ///
    /// A following `next` reads that tuple; a following `previous` reads
    /// the last tuple below `key`.
    pub fn before(&mut self, key: &K) -> Result<()> {
        match self.tree.leaf_for(key)? {
            Some((leaf_id, leaf)) => {
                let idx = match self.tree.search_leaf(&leaf, key) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                self.pos = CursorPos::Before { leaf: leaf_id, idx };
            }
            None => self.pos = CursorPos::BeforeFirst,
        }
        Ok(())
    }

    /// Positions just after the last tuple whose key is <= `key`.
    pub fn after(&mut self, key: &K) -> Result<()> {
        match self.tree.leaf_for(key)? {
            Some((leaf_id, leaf)) => {
                let idx = match self.tree.search_leaf(&leaf, key) {
                    Ok(i) => i + 1,
                    Err(i) => i,
                };
                self.pos = CursorPos::Before { leaf: leaf_id, idx };
            }
            None => self.pos = CursorPos::BeforeFirst,
        }
        Ok(())
    }

    /// Moves to the first tuple.
    pub fn first(&mut self) -> Result<Option<(K, V)>> {
        self.before_first();
        self.next()
    }

    /// Moves to the last tuple.
    pub fn last(&mut self) -> Result<Option<(K, V)>> {
        self.after_last();
        self.previous()
    }

    /// Advances to the next tuple.
    pub fn next(&mut self) -> Result<Option<(K, V)>> {
        match self.pos {
            CursorPos::BeforeFirst => match self.tree.first_leaf()? {
                Some(leaf_id) => self.forward_from(leaf_id, 0),
                None => {
                    self.pos = CursorPos::AfterLast;
                    Ok(None)
                }
            },
            CursorPos::Before { leaf, idx } => self.forward_from(leaf, idx),
            CursorPos::At { leaf, idx } => self.forward_from(leaf, idx + 1),
            CursorPos::AfterLast => Ok(None),
        }
    }

    /// Steps back to the previous tuple.
    pub fn previous(&mut self) -> Result<Option<(K, V)>> {
        match self.pos {
            CursorPos::BeforeFirst => Ok(None),
            CursorPos::Before { leaf, idx } | CursorPos::At { leaf, idx } => {
                self.backward_before(leaf, idx)
            }
            CursorPos::AfterLast => match self.tree.last_leaf()? {
                Some(leaf_id) => {
                    let leaf = self.tree.load_leaf(leaf_id)?;
                    if leaf.keys.is_empty() {
                        self.backward_chain(leaf.prev)
                    } else {
                        let idx = leaf.keys.len() - 1;
                        Ok(Some(self.settle(leaf_id, idx, &leaf)))
                    }
                }
                None => {
                    self.pos = CursorPos::BeforeFirst;
                    Ok(None)
                }
            },
        }
    }

    /// Returns the tuple the cursor is on.
    pub fn get(&self) -> Result<(K, V)> {
        match self.pos {
            CursorPos::At { leaf, idx } => {
                let leaf = self.tree.load_leaf(leaf)?;
                if idx >= leaf.keys.len() {
                    return Err(VellumError::CursorNotPositioned);
                }
                Ok((leaf.keys[idx].clone(), leaf.values[idx].clone()))
            }
            _ => Err(VellumError::CursorNotPositioned),
        }
    }

    fn settle(&mut self, leaf_id: RecordId, idx: usize, leaf: &LeafNode<K, V>) -> (K, V) {
        self.pos = CursorPos::At { leaf: leaf_id, idx };
        (leaf.keys[idx].clone(), leaf.values[idx].clone())
    }

    /// Returns the tuple at (leaf, idx), walking the next chain past the
    /// end of the leaf.
    fn forward_from(&mut self, mut leaf_id: RecordId, mut idx: usize) -> Result<Option<(K, V)>> {
        loop {
            let leaf = self.tree.load_leaf(leaf_id)?;
            if idx < leaf.keys.len() {
                return Ok(Some(self.settle(leaf_id, idx, &leaf)));
            }
            if !leaf.next.is_valid() {
                self.pos = CursorPos::AfterLast;
                return Ok(None);
            }
            leaf_id = leaf.next;
            idx = 0;
        }
    }

    /// Returns the last tuple strictly before slot (leaf, idx).
    fn backward_before(&mut self, leaf_id: RecordId, idx: usize) -> Result<Option<(K, V)>> {
        let leaf = self.tree.load_leaf(leaf_id)?;
        if idx > 0 && !leaf.keys.is_empty() {
            let i = (idx - 1).min(leaf.keys.len() - 1);
            return Ok(Some(self.settle(leaf_id, i, &leaf)));
        }
        self.backward_chain(leaf.prev)
    }

    /// Walks the prev chain to the last tuple of the nearest non-empty
    /// leaf.
    fn backward_chain(&mut self, mut cur: RecordId) -> Result<Option<(K, V)>> {
        while cur.is_valid() {
            let leaf = self.tree.load_leaf(cur)?;
            if !leaf.keys.is_empty() {
                let idx = leaf.keys.len() - 1;
                return Ok(Some(self.settle(cur, idx, &leaf)));
            }
            cur = leaf.prev;
        }
        self.pos = CursorPos::BeforeFirst;
        Ok(None)
    }
}
