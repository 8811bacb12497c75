//! Table cursors.
//!
//! The non-duplicate cursor is a thin shim over the primary tree cursor.
//! The duplicate-aware cursor composes the primary cursor (which yields
//! `(key, container)` tuples) with a per-key value cursor over either the
//! in-memory sorted set or the secondary tree, re-deriving the value
//! cursor every time the primary cursor advances to a new key. Both
//! cursors flatten to `(key, value)` tuples.

use super::{DupTable, DuplicateContainer, Table, TableInner};
use crate::manager::RecordManager;
use crate::tree::TreeCursor;
use vellum_common::{Result, VellumError};

/// Bidirectional cursor over a table's (key, value) tuples.
pub struct TableCursor<'a, K, V, M: RecordManager> {
    inner: CursorInner<'a, K, V, M>,
    current: Option<(K, V)>,
}

enum CursorInner<'a, K, V, M: RecordManager> {
    Single(TreeCursor<K, V, M>),
    Dup(DupCursor<'a, K, V, M>),
}

struct DupCursor<'a, K, V, M: RecordManager> {
    table: &'a DupTable<K, V, M>,
    primary: TreeCursor<K, DuplicateContainer<V>, M>,
    key: Option<K>,
    values: Option<ValuesCursor<V, M>>,
}

/// Per-key value iteration: sorted set or secondary tree.
enum ValuesCursor<V, M: RecordManager> {
    Set { values: Vec<V>, pos: SetPos },
    Tree(TreeCursor<V, (), M>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetPos {
    /// The value at this index is the next one forward.
    Before(usize),
    /// On the value at this index.
    At(usize),
    AfterLast,
}

impl<'a, K, V, M> TableCursor<'a, K, V, M>
where
    K: Clone,
    V: Clone + 'static,
    M: RecordManager + Clone,
{
    pub(super) fn new(table: &'a Table<K, V, M>) -> Self {
        let inner = match table.inner() {
            TableInner::Single(tree) => CursorInner::Single(tree.cursor()),
            TableInner::Dup(dup) => CursorInner::Dup(DupCursor {
                table: dup,
                primary: dup.tree.cursor(),
                key: None,
                values: None,
            }),
        };
        Self {
            inner,
            current: None,
        }
    }

    /// Positions before the first tuple.
    pub fn before_first(&mut self) {
        self.current = None;
        match &mut self.inner {
            CursorInner::Single(cursor) => cursor.before_first(),
            CursorInner::Dup(dup) => dup.reset(|primary| {
                primary.before_first();
                Ok(())
            }),
        }
    }

    /// Positions after the last tuple.
    pub fn after_last(&mut self) {
        self.current = None;
        match &mut self.inner {
            CursorInner::Single(cursor) => cursor.after_last(),
            CursorInner::Dup(dup) => dup.reset(|primary| {
                primary.after_last();
                Ok(())
            }),
        }
    }

    /// Positions just before the first key >= `key`.
    pub fn before(&mut self, key: &K) -> Result<()> {
        self.current = None;
        match &mut self.inner {
            CursorInner::Single(cursor) => cursor.before(key),
            CursorInner::Dup(dup) => {
                dup.key = None;
                dup.values = None;
                dup.primary.before(key)
            }
        }
    }

    /// Positions just after the last key <= `key`.
    pub fn after(&mut self, key: &K) -> Result<()> {
        self.current = None;
        match &mut self.inner {
            CursorInner::Single(cursor) => cursor.after(key),
            CursorInner::Dup(dup) => {
                dup.key = None;
                dup.values = None;
                dup.primary.after(key)
            }
        }
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
        let tuple = match &mut self.inner {
            CursorInner::Single(cursor) => cursor.next()?,
            CursorInner::Dup(dup) => dup.next()?,
        };
        self.current = tuple.clone();
        Ok(tuple)
    }

    /// Steps back to the previous tuple.
    pub fn previous(&mut self) -> Result<Option<(K, V)>> {
        let tuple = match &mut self.inner {
            CursorInner::Single(cursor) => cursor.previous()?,
            CursorInner::Dup(dup) => dup.previous()?,
        };
        self.current = tuple.clone();
        Ok(tuple)
    }

    /// Returns the tuple the cursor is on.
    pub fn get(&self) -> Result<(K, V)> {
        self.current
            .clone()
            .ok_or(VellumError::CursorNotPositioned)
    }
}

impl<'a, K, V, M> DupCursor<'a, K, V, M>
where
    K: Clone,
    V: Clone,
    M: RecordManager + Clone,
{
    fn reset<F>(&mut self, position: F)
    where
        F: FnOnce(&mut TreeCursor<K, DuplicateContainer<V>, M>) -> Result<()>,
    {
        self.key = None;
        self.values = None;
        let _ = position(&mut self.primary);
    }

    fn next(&mut self) -> Result<Option<(K, V)>> {
        loop {
            if let (Some(key), Some(values)) = (&self.key, &mut self.values) {
                if let Some(value) = values.next(self.table)? {
                    return Ok(Some((key.clone(), value)));
                }
            }
            match self.primary.next()? {
                Some((key, container)) => {
                    self.values = Some(ValuesCursor::forward(container, self.table)?);
                    self.key = Some(key);
                }
                None => {
                    self.key = None;
                    self.values = None;
                    return Ok(None);
                }
            }
        }
    }

    fn previous(&mut self) -> Result<Option<(K, V)>> {
        loop {
            if let (Some(key), Some(values)) = (&self.key, &mut self.values) {
                if let Some(value) = values.previous(self.table)? {
                    return Ok(Some((key.clone(), value)));
                }
            }
            match self.primary.previous()? {
                Some((key, container)) => {
                    self.values = Some(ValuesCursor::backward(container, self.table)?);
                    self.key = Some(key);
                }
                None => {
                    self.key = None;
                    self.values = None;
                    return Ok(None);
                }
            }
        }
    }
}

impl<V, M> ValuesCursor<V, M>
where
    V: Clone,
    M: RecordManager + Clone,
{
    fn forward<K: Clone>(
        container: DuplicateContainer<V>,
        table: &DupTable<K, V, M>,
    ) -> Result<Self> {
        match container {
            DuplicateContainer::Values(values) => Ok(ValuesCursor::Set {
                values,
                pos: SetPos::Before(0),
            }),
            DuplicateContainer::Redirect(id) => {
                let tree = table.dup_tree(id)?;
                Ok(ValuesCursor::Tree(tree.cursor()))
            }
        }
    }

    fn backward<K: Clone>(
        container: DuplicateContainer<V>,
        table: &DupTable<K, V, M>,
    ) -> Result<Self> {
        match container {
            DuplicateContainer::Values(values) => Ok(ValuesCursor::Set {
                values,
                pos: SetPos::AfterLast,
            }),
            DuplicateContainer::Redirect(id) => {
                let tree = table.dup_tree(id)?;
                let mut cursor = tree.cursor();
                cursor.after_last();
                Ok(ValuesCursor::Tree(cursor))
            }
        }
    }

    fn next<K: Clone>(&mut self, _table: &DupTable<K, V, M>) -> Result<Option<V>> {
        match self {
            ValuesCursor::Set { values, pos } => {
                let next_idx = match *pos {
                    SetPos::Before(i) => i,
                    SetPos::At(i) => i + 1,
                    SetPos::AfterLast => return Ok(None),
                };
                if next_idx < values.len() {
                    *pos = SetPos::At(next_idx);
                    Ok(Some(values[next_idx].clone()))
                } else {
                    *pos = SetPos::AfterLast;
                    Ok(None)
                }
            }
            ValuesCursor::Tree(cursor) => Ok(cursor.next()?.map(|(v, ())| v)),
        }
    }

    fn previous<K: Clone>(&mut self, _table: &DupTable<K, V, M>) -> Result<Option<V>> {
        match self {
            ValuesCursor::Set { values, pos } => {
                let prev_idx = match *pos {
                    SetPos::Before(i) | SetPos::At(i) => {
                        if i == 0 {
                            *pos = SetPos::Before(0);
                            return Ok(None);
                        }
                        i - 1
                    }
                    SetPos::AfterLast => {
                        if values.is_empty() {
                            return Ok(None);
                        }
                        values.len() - 1
                    }
                };
                *pos = SetPos::At(prev_idx);
                Ok(Some(values[prev_idx].clone()))
            }
            ValuesCursor::Tree(cursor) => Ok(cursor.previous()?.map(|(v, ())| v)),
        }
    }
}
