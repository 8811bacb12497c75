//! One-writer / many-readers MVCC over a record manager.
//!
//! A read action snapshots the current version; any number may run
//! concurrently and never block each other. A write action holds an
//! exclusive lock, buffers its updates and deletes privately, and makes
//! them visible in one step when it finishes: overwritten values are
//! snapshotted into the version cache for still-running readers, the
//! buffer is applied, the wrapped manager commits, and the current
//! version advances. Aborting discards the buffer, deletes any records
//! the action inserted, and rolls the wrapped manager back; nothing
//! becomes visible.
//!
//! Version-cache entries are reclaimed as the minimum active read
//! version advances past them.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use vellum_common::{RecordId, Result, Serializer, VellumError};
use vellum_store::RecordManager;

/// A value as of some version; `None` records that the id did not exist.
type Snapshot = Option<Arc<Vec<u8>>>;

struct VersionState {
    /// Version new read actions snapshot.
    current: u64,
    /// Active reader count per version.
    readers: BTreeMap<u64, usize>,
    /// Per record: snapshots keyed by the last version they are valid
    /// for.
    versions: HashMap<RecordId, BTreeMap<u64, Snapshot>>,
}

impl VersionState {
    fn prune(&mut self) {
        let min_read = self
            .readers
            .keys()
            .next()
            .copied()
            .unwrap_or(self.current);
        self.versions.retain(|_, snapshots| {
            snapshots.retain(|&valid_through, _| valid_through >= min_read);
            !snapshots.is_empty()
        });
    }

    fn fetch_at(&self, id: RecordId, version: u64) -> Option<Result<Vec<u8>>> {
        let snapshots = self.versions.get(&id)?;
        let (_, snapshot) = snapshots.range(version..).next()?;
        Some(match snapshot {
            Some(bytes) => Ok(bytes.as_ref().clone()),
            None => Err(VellumError::RecordNotFound { id: id.0 }),
        })
    }
}

/// MVCC wrapper around a record manager.
///
/// All access to the wrapped manager must go through this wrapper's
/// actions; side channels would bypass the version bookkeeping.
pub struct VersionedRecordManager<M: RecordManager> {
    inner: Arc<M>,
    state: Arc<Mutex<VersionState>>,
    writer: Arc<(Mutex<bool>, Condvar)>,
}

impl<M: RecordManager> VersionedRecordManager<M> {
    /// Wraps a record manager.
    pub fn new(inner: M) -> Self {
        Self {
            inner: Arc::new(inner),
            state: Arc::new(Mutex::new(VersionState {
                current: 1,
                readers: BTreeMap::new(),
                versions: HashMap::new(),
            })),
            writer: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Version new readers currently snapshot.
    pub fn current_version(&self) -> u64 {
        self.state.lock().current
    }

    /// Begins a read-only action at the current version.
    pub fn read(&self) -> ReadAction<M> {
        let mut state = self.state.lock();
        let version = state.current;
        *state.readers.entry(version).or_insert(0) += 1;
        ReadAction {
            version,
            inner: Arc::clone(&self.inner),
            state: Arc::clone(&self.state),
        }
    }

    /// Begins a write action, blocking while another writer is active.
    pub fn write(&self) -> WriteAction<M> {
        let (lock, cvar) = &*self.writer;
        let mut busy = lock.lock();
        while *busy {
            cvar.wait(&mut busy);
        }
        *busy = true;
        drop(busy);

        let read_version = self.state.lock().current;
        WriteAction {
            read_version,
            inner: Arc::clone(&self.inner),
            state: Arc::clone(&self.state),
            writer: Arc::clone(&self.writer),
            pending: HashMap::new(),
            inserted: Vec::new(),
            finished: false,
        }
    }
}

/// A read-only action: sees data as of its snapshot version.
///
/// The action ends when it is dropped.
pub struct ReadAction<M: RecordManager> {
    version: u64,
    inner: Arc<M>,
    state: Arc<Mutex<VersionState>>,
}

impl<M: RecordManager> ReadAction<M> {
    /// The version this action reads at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Reads a record as of this action's version.
    pub fn fetch_bytes(&self, id: RecordId) -> Result<Vec<u8>> {
        if let Some(result) = self.state.lock().fetch_at(id, self.version) {
            return result;
        }
        self.inner.fetch_bytes(id)
    }

    /// Reads a value through a serializer.
    pub fn fetch<T>(&self, id: RecordId, serializer: &dyn Serializer<T>) -> Result<T> {
        serializer.deserialize(&self.fetch_bytes(id)?)
    }
}

impl<M: RecordManager> Drop for ReadAction<M> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&self.version) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&self.version);
            }
        }
        state.prune();
    }
}

enum Pending {
    Update(Vec<u8>),
    Delete,
}

/// An exclusive write action.
///
/// Updates and deletes are buffered until [`WriteAction::finish`];
/// inserts allocate real ids immediately so the new records can be
/// referenced, and are undone on abort.
pub struct WriteAction<M: RecordManager> {
    read_version: u64,
    inner: Arc<M>,
    state: Arc<Mutex<VersionState>>,
    writer: Arc<(Mutex<bool>, Condvar)>,
    pending: HashMap<RecordId, Pending>,
    inserted: Vec<RecordId>,
    finished: bool,
}

impl<M: RecordManager> WriteAction<M> {
    /// Stores a new record.
    pub fn insert_bytes(&mut self, data: &[u8]) -> Result<RecordId> {
        let id = self.inner.insert_bytes(data)?;
        self.inserted.push(id);
        Ok(id)
    }

    /// Buffers a rewrite of an existing record.
    pub fn update_bytes(&mut self, id: RecordId, data: &[u8]) -> Result<()> {
        // Validate the id now; failure at finish time would be too late.
        self.fetch_bytes(id)?;
        self.pending.insert(id, Pending::Update(data.to_vec()));
        Ok(())
    }

    /// Buffers a delete.
    pub fn delete(&mut self, id: RecordId) -> Result<()> {
        self.fetch_bytes(id)?;
        self.pending.insert(id, Pending::Delete);
        Ok(())
    }

    /// Reads a record, seeing this action's own buffered writes.
    pub fn fetch_bytes(&self, id: RecordId) -> Result<Vec<u8>> {
        match self.pending.get(&id) {
            Some(Pending::Update(data)) => return Ok(data.clone()),
            Some(Pending::Delete) => {
                return Err(VellumError::RecordNotFound { id: id.0 })
            }
            None => {}
        }
        if let Some(result) = self.state.lock().fetch_at(id, self.read_version) {
            return result;
        }
        self.inner.fetch_bytes(id)
    }

    /// Stores a value through a serializer.
    pub fn insert<T>(&mut self, value: &T, serializer: &dyn Serializer<T>) -> Result<RecordId> {
        let mut buf = Vec::new();
        serializer.serialize(value, &mut buf)?;
        self.insert_bytes(&buf)
    }

    /// Buffers a typed rewrite.
    pub fn update<T>(
        &mut self,
        id: RecordId,
        value: &T,
        serializer: &dyn Serializer<T>,
    ) -> Result<()> {
        let mut buf = Vec::new();
        serializer.serialize(value, &mut buf)?;
        self.update_bytes(id, &buf)
    }

    /// Reads a value through a serializer.
    pub fn fetch<T>(&self, id: RecordId, serializer: &dyn Serializer<T>) -> Result<T> {
        serializer.deserialize(&self.fetch_bytes(id)?)
    }

    /// Applies the buffer, commits the wrapped manager, and publishes a
    /// new version.
    pub fn finish(mut self) -> Result<()> {
        // Snapshot overwritten state for readers that are still at or
        // below the current version.
        {
            let mut state = self.state.lock();
            let valid_through = state.current;
            for &id in self.pending.keys() {
                let old = self.inner.fetch_bytes(id).ok().map(Arc::new);
                state
                    .versions
                    .entry(id)
                    .or_default()
                    .insert(valid_through, old);
            }
            for &id in &self.inserted {
                state
                    .versions
                    .entry(id)
                    .or_default()
                    .insert(valid_through, None);
            }
        }

        for (id, change) in &self.pending {
            match change {
                Pending::Update(data) => self.inner.update_bytes(*id, data)?,
                Pending::Delete => self.inner.delete(*id)?,
            }
        }
        self.inner.commit()?;

        let mut state = self.state.lock();
        state.current += 1;
        state.prune();
        drop(state);

        self.finished = true;
        self.release_writer();
        Ok(())
    }

    /// Abandons the action: nothing it did becomes visible.
    pub fn abort(mut self) -> Result<()> {
        self.abort_in_place()?;
        self.finished = true;
        self.release_writer();
        Ok(())
    }

    fn abort_in_place(&mut self) -> Result<()> {
        for &id in &self.inserted {
            // Best effort; the rollback below discards the allocation
            // anyway when it was never committed.
            let _ = self.inner.delete(id);
        }
        self.pending.clear();
        self.inner.rollback()
    }

    fn release_writer(&self) {
        let (lock, cvar) = &*self.writer;
        *lock.lock() = false;
        cvar.notify_one();
    }
}

impl<M: RecordManager> Drop for WriteAction<M> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.abort_in_place();
            self.release_writer();
        }
    }
}
