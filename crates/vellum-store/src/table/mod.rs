//! Ordered tables over the record manager.
//!
//! A table associates keys with one or more values through one or two
//! B+Trees. Without duplicates, values sit directly in the primary tree.
//! With duplicates, each key holds a [`DuplicateContainer`]: a sorted set
//! of values until the set outgrows `dup_limit`, then a redirect to a
//! secondary tree keyed by the values themselves. The conversion happens
//! inside the same `put` that crosses the threshold.
//!
//! Tables bootstrap through the named object directory: opening a table
//! by name finds or creates its primary tree.

mod dups;

pub mod cursor;

pub use cursor::TableCursor;
pub use dups::{ContainerSerializer, DuplicateContainer};

use crate::manager::RecordManager;
use crate::tree::{BTree, Comparator};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use vellum_common::{RecordId, Result, Serializer, UnitSerializer};

/// Construction parameters for a table.
#[derive(Clone)]
pub struct TableOptions {
    /// Allow more than one value per key.
    pub duplicates: bool,
    /// Value-set size beyond which a key's values move to a secondary
    /// tree. Only meaningful with `duplicates`.
    pub dup_limit: usize,
    /// Maximum entries per tree node.
    pub order: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            duplicates: false,
            dup_limit: 32,
            order: crate::tree::DEFAULT_ORDER,
        }
    }
}

/// A named, ordered key/value table.
pub struct Table<K, V, M: RecordManager> {
    name: String,
    val_cmp: Comparator<V>,
    inner: TableInner<K, V, M>,
}

pub(crate) enum TableInner<K, V, M: RecordManager> {
    Single(Arc<BTree<K, V, M>>),
    Dup(DupTable<K, V, M>),
}

pub(crate) struct DupTable<K, V, M: RecordManager> {
    pub(crate) tree: Arc<BTree<K, DuplicateContainer<V>, M>>,
    rec: M,
    dup_limit: usize,
    order: usize,
    val_ser: Arc<dyn Serializer<V>>,
    val_cmp: Comparator<V>,
    /// Secondary-tree handles, cached for the lifetime of this table.
    dup_trees: Mutex<HashMap<RecordId, Arc<BTree<V, (), M>>>>,
}

impl<K, V, M> Table<K, V, M>
where
    K: Clone,
    V: Clone + 'static,
    M: RecordManager + Clone,
{
    /// Opens the table registered under `name`, creating it on first use.
    pub fn open(
        rec: M,
        name: &str,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
        key_cmp: Comparator<K>,
        val_cmp: Comparator<V>,
        options: TableOptions,
    ) -> Result<Self> {
        let existing = rec.get_named(name)?;

        let inner = if options.duplicates {
            let container_ser: Arc<dyn Serializer<DuplicateContainer<V>>> =
                Arc::new(ContainerSerializer::new(Arc::clone(&val_ser)));
            let tree = match existing {
                Some(id) => BTree::load(rec.clone(), id, key_ser, container_ser, key_cmp)?,
                None => {
                    let tree = BTree::create(
                        rec.clone(),
                        key_ser,
                        container_ser,
                        key_cmp,
                        options.order,
                    )?;
                    rec.set_named(name, Some(tree.id()))?;
                    tree
                }
            };
            TableInner::Dup(DupTable {
                tree: Arc::new(tree),
                rec,
                dup_limit: options.dup_limit,
                order: options.order,
                val_ser,
                val_cmp: Arc::clone(&val_cmp),
                dup_trees: Mutex::new(HashMap::new()),
            })
        } else {
            let tree = match existing {
                Some(id) => BTree::load(rec.clone(), id, key_ser, val_ser, key_cmp)?,
                None => {
                    let tree =
                        BTree::create(rec.clone(), key_ser, val_ser, key_cmp, options.order)?;
                    rec.set_named(name, Some(tree.id()))?;
                    tree
                }
            };
            TableInner::Single(Arc::new(tree))
        };

        Ok(Self {
            name: name.to_string(),
            val_cmp,
            inner,
        })
    }

    /// Returns the table's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the table allows duplicate values per key.
    pub fn allows_duplicates(&self) -> bool {
        matches!(self.inner, TableInner::Dup(_))
    }

    /// Associates `value` with `key`.
    ///
    /// Without duplicates the previous value (if any) is replaced and
    /// returned. With duplicates the value joins the key's value set; an
    /// already-present value is returned unchanged instead of being added
    /// twice.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        match &self.inner {
            TableInner::Single(tree) => tree.insert(key, value, true),
            TableInner::Dup(dup) => dup.put(key, value),
        }
    }

    /// Returns the value for `key`: the lowest one per the value
    /// comparator when duplicates are enabled.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        match &self.inner {
            TableInner::Single(tree) => tree.find(key),
            TableInner::Dup(dup) => dup.get(key),
        }
    }

    /// Removes one value from a key. Removing the last value removes the
    /// key.
    pub fn remove(&self, key: &K, value: &V) -> Result<bool> {
        match &self.inner {
            TableInner::Single(tree) => match tree.find(key)? {
                Some(stored) if (self.val_cmp)(&stored, value) == Ordering::Equal => {
                    tree.remove(key)?;
                    Ok(true)
                }
                _ => Ok(false),
            },
            TableInner::Dup(dup) => dup.remove(key, value),
        }
    }

    /// Removes a key and all of its values.
    pub fn remove_all(&self, key: &K) -> Result<bool> {
        match &self.inner {
            TableInner::Single(tree) => Ok(tree.remove(key)?.is_some()),
            TableInner::Dup(dup) => dup.remove_all(key),
        }
    }

    /// Returns true if `key` is present.
    pub fn has(&self, key: &K) -> Result<bool> {
        match &self.inner {
            TableInner::Single(tree) => Ok(tree.find(key)?.is_some()),
            TableInner::Dup(dup) => Ok(dup.tree.find(key)?.is_some()),
        }
    }

    /// Returns true if `key` holds `value`.
    pub fn has_value(&self, key: &K, value: &V) -> Result<bool> {
        match &self.inner {
            TableInner::Single(tree) => Ok(match tree.find(key)? {
                Some(stored) => (self.val_cmp)(&stored, value) == Ordering::Equal,
                None => false,
            }),
            TableInner::Dup(dup) => dup.has_value(key, value),
        }
    }

    /// Returns true if any key greater than or equal to `key` is present.
    pub fn has_at_least(&self, key: &K) -> Result<bool> {
        let mut cursor = self.cursor();
        cursor.before(key)?;
        Ok(cursor.next()?.is_some())
    }

    /// Number of (key, value) tuples in the table.
    pub fn len(&self) -> Result<u64> {
        match &self.inner {
            TableInner::Single(tree) => Ok(tree.len()),
            TableInner::Dup(dup) => dup.len(),
        }
    }

    /// Returns true when the table holds no tuples.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of values stored under `key`.
    pub fn count(&self, key: &K) -> Result<u64> {
        match &self.inner {
            TableInner::Single(tree) => Ok(if tree.find(key)?.is_some() { 1 } else { 0 }),
            TableInner::Dup(dup) => dup.count(key),
        }
    }

    /// Opens a cursor over the table's (key, value) tuples.
    pub fn cursor(&self) -> TableCursor<'_, K, V, M> {
        TableCursor::new(self)
    }

    pub(crate) fn inner(&self) -> &TableInner<K, V, M> {
        &self.inner
    }
}

impl<K, V, M> DupTable<K, V, M>
where
    K: Clone,
    V: Clone,
    M: RecordManager + Clone,
{
    fn put(&self, key: K, value: V) -> Result<Option<V>> {
        match self.tree.find(&key)? {
            None => {
                self.tree
                    .insert(key, DuplicateContainer::Values(vec![value]), true)?;
                Ok(None)
            }
            Some(DuplicateContainer::Values(mut values)) => {
                match values.binary_search_by(|probe| (self.val_cmp)(probe, &value)) {
                    Ok(_) => Ok(Some(value)),
                    Err(i) => {
                        if values.len() + 1 > self.dup_limit {
                            // Threshold crossed: migrate every value into a
                            // fresh secondary tree and leave a redirect
                            // behind, all within this put.
                            let sec = self.create_dup_tree()?;
                            for v in values {
                                sec.insert(v, (), false)?;
                            }
                            sec.insert(value, (), false)?;
                            let id = sec.id();
                            self.dup_trees.lock().insert(id, sec);
                            self.tree
                                .insert(key, DuplicateContainer::Redirect(id), true)?;
                        } else {
                            values.insert(i, value);
                            self.tree
                                .insert(key, DuplicateContainer::Values(values), true)?;
                        }
                        Ok(None)
                    }
                }
            }
            Some(DuplicateContainer::Redirect(id)) => {
                let sec = self.dup_tree(id)?;
                match sec.insert(value.clone(), (), false)? {
                    Some(()) => Ok(Some(value)),
                    None => Ok(None),
                }
            }
        }
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        match self.tree.find(key)? {
            None => Ok(None),
            Some(DuplicateContainer::Values(mut values)) => {
                if values.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(values.remove(0)))
                }
            }
            Some(DuplicateContainer::Redirect(id)) => {
                Ok(self.dup_tree(id)?.first()?.map(|(v, ())| v))
            }
        }
    }

    fn remove(&self, key: &K, value: &V) -> Result<bool> {
        match self.tree.find(key)? {
            None => Ok(false),
            Some(DuplicateContainer::Values(mut values)) => {
                match values.binary_search_by(|probe| (self.val_cmp)(probe, value)) {
                    Ok(i) => {
                        values.remove(i);
                        if values.is_empty() {
                            self.tree.remove(key)?;
                        } else {
                            self.tree
                                .insert(key.clone(), DuplicateContainer::Values(values), true)?;
                        }
                        Ok(true)
                    }
                    Err(_) => Ok(false),
                }
            }
            Some(DuplicateContainer::Redirect(id)) => {
                let sec = self.dup_tree(id)?;
                if sec.remove(value)?.is_none() {
                    return Ok(false);
                }
                if sec.is_empty() {
                    sec.destroy()?;
                    self.dup_trees.lock().remove(&id);
                    self.tree.remove(key)?;
                }
                Ok(true)
            }
        }
    }

    fn remove_all(&self, key: &K) -> Result<bool> {
        match self.tree.remove(key)? {
            None => Ok(false),
            Some(DuplicateContainer::Values(_)) => Ok(true),
            Some(DuplicateContainer::Redirect(id)) => {
                let sec = self.dup_tree(id)?;
                sec.destroy()?;
                self.dup_trees.lock().remove(&id);
                Ok(true)
            }
        }
    }

    fn has_value(&self, key: &K, value: &V) -> Result<bool> {
        match self.tree.find(key)? {
            None => Ok(false),
            Some(DuplicateContainer::Values(values)) => Ok(values
                .binary_search_by(|probe| (self.val_cmp)(probe, value))
                .is_ok()),
            Some(DuplicateContainer::Redirect(id)) => {
                Ok(self.dup_tree(id)?.find(value)?.is_some())
            }
        }
    }

    fn count(&self, key: &K) -> Result<u64> {
        match self.tree.find(key)? {
            None => Ok(0),
            Some(DuplicateContainer::Values(values)) => Ok(values.len() as u64),
            Some(DuplicateContainer::Redirect(id)) => Ok(self.dup_tree(id)?.len()),
        }
    }

    fn len(&self) -> Result<u64> {
        let mut cursor = self.tree.cursor();
        let mut total = 0u64;
        while let Some((_, container)) = cursor.next()? {
            total += match container {
                DuplicateContainer::Values(values) => values.len() as u64,
                DuplicateContainer::Redirect(id) => self.dup_tree(id)?.len(),
            };
        }
        Ok(total)
    }

    fn create_dup_tree(&self) -> Result<Arc<BTree<V, (), M>>> {
        let tree = BTree::create(
            self.rec.clone(),
            Arc::clone(&self.val_ser),
            Arc::new(UnitSerializer),
            Arc::clone(&self.val_cmp),
            self.order,
        )?;
        Ok(Arc::new(tree))
    }

    /// Fetches (and caches) the secondary tree behind a redirect.
    pub(crate) fn dup_tree(&self, id: RecordId) -> Result<Arc<BTree<V, (), M>>> {
        let mut cache = self.dup_trees.lock();
        if let Some(tree) = cache.get(&id) {
            return Ok(Arc::clone(tree));
        }
        let tree = Arc::new(BTree::load(
            self.rec.clone(),
            id,
            Arc::clone(&self.val_ser),
            Arc::new(UnitSerializer),
            Arc::clone(&self.val_cmp),
        )?);
        cache.insert(id, Arc::clone(&tree));
        Ok(tree)
    }
}
