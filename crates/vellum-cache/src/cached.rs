//! Record manager wrapper with a bounded object cache.

use crate::policy::{CachePolicy, LruPolicy};
use parking_lot::Mutex;
use std::io;
use vellum_common::{RecordId, Result, VellumError};
use vellum_store::RecordManager;

struct CacheEntry {
    data: Vec<u8>,
    dirty: bool,
}

struct CacheState {
    entries: std::collections::HashMap<RecordId, CacheEntry>,
    policy: Box<dyn CachePolicy>,
    capacity: usize,
}

/// Caches record bytes in memory to avoid repeated reads of hot records.
///
/// Updates are not written through: a dirty entry reaches the wrapped
/// manager when it is evicted or at `commit()`. `fetch_bytes` returns a
/// defensive copy so callers cannot mutate cached state.
pub struct CachedRecordManager<M> {
    inner: M,
    state: Mutex<CacheState>,
}

impl<M: RecordManager> CachedRecordManager<M> {
    /// Wraps `inner` with an LRU cache of `capacity` records.
    pub fn new(inner: M, capacity: usize) -> Self {
        Self::with_policy(inner, capacity, Box::new(LruPolicy::new()))
    }

    /// Wraps `inner` with a caller-supplied eviction policy.
    pub fn with_policy(inner: M, capacity: usize, policy: Box<dyn CachePolicy>) -> Self {
        Self {
            inner,
            state: Mutex::new(CacheState {
                entries: std::collections::HashMap::new(),
                policy,
                capacity,
            }),
        }
    }

    /// Returns the wrapped manager.
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Number of records currently cached.
    pub fn cached_records(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn cache_put(
        &self,
        state: &mut CacheState,
        id: RecordId,
        data: Vec<u8>,
        dirty: bool,
    ) -> Result<()> {
        if state.capacity == 0 {
            if dirty {
                return self.inner.update_bytes(id, &data);
            }
            return Ok(());
        }

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.data = data;
            entry.dirty = entry.dirty || dirty;
            state.policy.touch(id);
            return Ok(());
        }

        while state.entries.len() >= state.capacity {
            let victim = match state.policy.evict() {
                Some(victim) => victim,
                None => {
                    // The policy cannot name a victim for a full cache.
                    return Err(VellumError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "cache eviction policy rejected the insert",
                    )));
                }
            };
            if let Some(entry) = state.entries.remove(&victim) {
                if entry.dirty {
                    if let Err(e) = self.inner.update_bytes(victim, &entry.data) {
                        // Keep the entry rather than lose the write.
                        state.entries.insert(victim, entry);
                        state.policy.touch(victim);
                        return Err(e);
                    }
                }
            }
        }

        state.entries.insert(id, CacheEntry { data, dirty });
        state.policy.touch(id);
        Ok(())
    }

    fn flush_dirty(&self, state: &mut CacheState) -> Result<()> {
        let dirty_ids: Vec<RecordId> = state
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(&id, _)| id)
            .collect();
        for id in dirty_ids {
            let entry = state.entries.get_mut(&id).expect("dirty entry present");
            self.inner.update_bytes(id, &entry.data)?;
            entry.dirty = false;
        }
        Ok(())
    }
}

impl<M: RecordManager> RecordManager for CachedRecordManager<M> {
    fn insert_bytes(&self, data: &[u8]) -> Result<RecordId> {
        let id = self.inner.insert_bytes(data)?;
        let mut state = self.state.lock();
        self.cache_put(&mut state, id, data.to_vec(), false)?;
        Ok(id)
    }

    fn update_bytes(&self, id: RecordId, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.entries.contains_key(&id) {
            // Validate the id up front; a bogus id must fail here, not at
            // some later flush.
            self.inner.fetch_bytes(id)?;
        }
        self.cache_put(&mut state, id, data.to_vec(), true)
    }

    fn fetch_bytes(&self, id: RecordId) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(&id) {
            let data = entry.data.clone();
            state.policy.touch(id);
            return Ok(data);
        }
        let data = self.inner.fetch_bytes(id)?;
        self.cache_put(&mut state, id, data.clone(), false)?;
        Ok(data)
    }

    fn delete(&self, id: RecordId) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.remove(&id);
        state.policy.remove(id);
        self.inner.delete(id)
    }

    fn get_root(&self, slot: usize) -> Result<RecordId> {
        self.inner.get_root(slot)
    }

    fn set_root(&self, slot: usize, id: RecordId) -> Result<()> {
        self.inner.set_root(slot, id)
    }

    fn get_named(&self, name: &str) -> Result<Option<RecordId>> {
        self.inner.get_named(name)
    }

    fn set_named(&self, name: &str, id: Option<RecordId>) -> Result<()> {
        self.inner.set_named(name, id)
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_dirty(&mut state)?;
        self.inner.commit()
    }

    fn rollback(&self) -> Result<()> {
        // Cached entries may reflect rolled-back state; drop them all.
        let mut state = self.state.lock();
        state.entries.clear();
        state.policy.clear();
        self.inner.rollback()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_dirty(&mut state)?;
        state.entries.clear();
        state.policy.clear();
        self.inner.close()
    }
}
