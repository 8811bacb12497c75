//! The base record manager: the public façade over the storage layers.
//!
//! Insert threads a record through the physical row manager and hands the
//! resulting location to the translation table, which mints the stable
//! logical id callers keep. Update relocates physically as needed and
//! re-targets the translation slot. All mutating operations serialize on
//! one lock; commit and rollback delegate to the block store.

use crate::block::BlockStore;
use crate::manager::RecordManager;
use crate::named::NameDirectory;
use crate::{logical, physical};
use parking_lot::{Mutex, MutexGuard};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use vellum_common::{RecordId, Result, StoreConfig, VellumError};

/// Root slot holding the named object directory record.
pub const NAME_DIRECTORY_ROOT: usize = 0;

/// Record manager backed directly by the block store.
pub struct BaseRecordManager {
    store: Mutex<BlockStore>,
    closed: AtomicBool,
}

impl BaseRecordManager {
    /// Opens (or creates) a store at `base` (`<base>.db` / `<base>.lg`).
    ///
    /// Crash recovery runs before the manager is handed out: a non-empty
    /// transaction log is replayed into the data file and truncated.
    pub fn open(base: &Path, config: StoreConfig) -> Result<Self> {
        let store = BlockStore::open(base, config)?;
        Ok(Self {
            store: Mutex::new(store),
            closed: AtomicBool::new(false),
        })
    }

    /// Opens a store with default configuration.
    pub fn open_default(base: &Path) -> Result<Self> {
        Self::open(base, StoreConfig::default())
    }

    fn store(&self) -> Result<MutexGuard<'_, BlockStore>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VellumError::StoreClosed);
        }
        Ok(self.store.lock())
    }

    /// Forces the data file to disk without committing anything.
    pub fn sync(&self) -> Result<()> {
        self.store()?.sync()
    }

    fn load_directory(store: &mut BlockStore) -> Result<(NameDirectory, RecordId)> {
        let header = store.read_header()?;
        let dir_id = RecordId(header.root(NAME_DIRECTORY_ROOT)?);
        if !dir_id.is_valid() {
            return Ok((NameDirectory::new(), RecordId::INVALID));
        }
        let loc = logical::fetch(store, dir_id)?;
        let data = physical::fetch(store, loc)?;
        Ok((NameDirectory::decode(&data)?, dir_id))
    }
}

impl RecordManager for BaseRecordManager {
    fn insert_bytes(&self, data: &[u8]) -> Result<RecordId> {
        let mut store = self.store()?;
        let loc = physical::insert(&mut store, data)?;
        logical::insert(&mut store, loc)
    }

    fn update_bytes(&self, id: RecordId, data: &[u8]) -> Result<()> {
        let mut store = self.store()?;
        let loc = logical::fetch(&mut store, id)?;
        let new_loc = physical::update(&mut store, loc, data)?;
        if new_loc != loc {
            logical::update(&mut store, id, new_loc)?;
        }
        Ok(())
    }

    fn fetch_bytes(&self, id: RecordId) -> Result<Vec<u8>> {
        let mut store = self.store()?;
        let loc = logical::fetch(&mut store, id)?;
        physical::fetch(&mut store, loc)
    }

    fn delete(&self, id: RecordId) -> Result<()> {
        let mut store = self.store()?;
        let loc = logical::fetch(&mut store, id)?;
        physical::delete(&mut store, loc)?;
        logical::delete(&mut store, id)
    }

    fn get_root(&self, slot: usize) -> Result<RecordId> {
        let mut store = self.store()?;
        let header = store.read_header()?;
        Ok(RecordId(header.root(slot)?))
    }

    fn set_root(&self, slot: usize, id: RecordId) -> Result<()> {
        let mut store = self.store()?;
        let mut header = store.read_header()?;
        header.set_root(slot, id.0)?;
        store.write_header(&header)
    }

    fn get_named(&self, name: &str) -> Result<Option<RecordId>> {
        let mut store = self.store()?;
        let (directory, _) = Self::load_directory(&mut store)?;
        Ok(directory.get(name))
    }

    fn set_named(&self, name: &str, id: Option<RecordId>) -> Result<()> {
        let mut store = self.store()?;
        let (mut directory, dir_id) = Self::load_directory(&mut store)?;
        directory.set(name, id);
        let encoded = directory.encode();

        if dir_id.is_valid() {
            let loc = logical::fetch(&mut store, dir_id)?;
            let new_loc = physical::update(&mut store, loc, &encoded)?;
            if new_loc != loc {
                logical::update(&mut store, dir_id, new_loc)?;
            }
        } else {
            // Lazily create the directory record on first registration.
            let loc = physical::insert(&mut store, &encoded)?;
            let dir_id = logical::insert(&mut store, loc)?;
            let mut header = store.read_header()?;
            header.set_root(NAME_DIRECTORY_ROOT, dir_id.0)?;
            store.write_header(&header)?;
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.store()?.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.store()?.rollback()
    }

    fn close(&self) -> Result<()> {
        let mut store = self.store()?;
        store.close()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for BaseRecordManager {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.store.lock().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vellum_common::{ByteArraySerializer, StringSerializer};

    fn create_test_manager() -> (BaseRecordManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            fsync_enabled: false,
            ..StoreConfig::default()
        };
        let manager = BaseRecordManager::open(&dir.path().join("t"), config).unwrap();
        (manager, dir)
    }

    #[test]
    fn test_insert_fetch_roundtrip() {
        let (manager, _dir) = create_test_manager();

        let id = manager.insert_bytes(b"a record").unwrap();
        assert_eq!(manager.fetch_bytes(id).unwrap(), b"a record");
    }

    #[test]
    fn test_serializer_helpers() {
        let (manager, _dir) = create_test_manager();

        let id = manager
            .insert(&"typed value".to_string(), &StringSerializer)
            .unwrap();
        let value: String = manager.fetch(id, &StringSerializer).unwrap();
        assert_eq!(value, "typed value");

        manager
            .update(id, &"rewritten".to_string(), &StringSerializer)
            .unwrap();
        let value: String = manager.fetch(id, &StringSerializer).unwrap();
        assert_eq!(value, "rewritten");
    }

    #[test]
    fn test_update_grows_record_id_stable() {
        let (manager, _dir) = create_test_manager();

        let id = manager.insert_bytes(&[1u8; 16]).unwrap();
        // Much larger than the original capacity class: forces relocation.
        let grown = vec![2u8; 5000];
        manager.update_bytes(id, &grown).unwrap();
        assert_eq!(manager.fetch_bytes(id).unwrap(), grown);
    }

    #[test]
    fn test_delete_then_fetch_fails() {
        let (manager, _dir) = create_test_manager();

        let id = manager.insert_bytes(b"gone soon").unwrap();
        manager.delete(id).unwrap();
        assert!(matches!(
            manager.fetch_bytes(id),
            Err(VellumError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn test_roots() {
        let (manager, _dir) = create_test_manager();

        assert_eq!(manager.get_root(3).unwrap(), RecordId::INVALID);
        manager.set_root(3, RecordId(777)).unwrap();
        assert_eq!(manager.get_root(3).unwrap(), RecordId(777));
    }

    #[test]
    fn test_named_objects() {
        let (manager, _dir) = create_test_manager();

        assert_eq!(manager.get_named("tree").unwrap(), None);

        let id = manager.insert_bytes(b"tree meta").unwrap();
        manager.set_named("tree", Some(id)).unwrap();
        assert_eq!(manager.get_named("tree").unwrap(), Some(id));

        manager.set_named("tree", None).unwrap();
        assert_eq!(manager.get_named("tree").unwrap(), None);
    }

    #[test]
    fn test_named_objects_survive_reopen() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        let config = StoreConfig {
            fsync_enabled: false,
            ..StoreConfig::default()
        };

        let id;
        {
            let manager = BaseRecordManager::open(&base, config.clone()).unwrap();
            id = manager.insert_bytes(b"payload").unwrap();
            manager.set_named("anchor", Some(id)).unwrap();
            manager.commit().unwrap();
            manager.close().unwrap();
        }

        {
            let manager = BaseRecordManager::open(&base, config).unwrap();
            assert_eq!(manager.get_named("anchor").unwrap(), Some(id));
            assert_eq!(manager.fetch_bytes(id).unwrap(), b"payload");
        }
    }

    #[test]
    fn test_rollback_forgets_insert() {
        let (manager, _dir) = create_test_manager();

        // Committed baseline so the header has a durable image.
        let keep = manager.insert_bytes(b"keep").unwrap();
        manager.commit().unwrap();

        let id = manager.insert_bytes(b"uncommitted").unwrap();
        manager.rollback().unwrap();

        assert!(manager.fetch_bytes(id).is_err());
        assert_eq!(manager.fetch_bytes(keep).unwrap(), b"keep");
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (manager, _dir) = create_test_manager();

        manager.close().unwrap();
        assert!(matches!(
            manager.insert_bytes(b"x"),
            Err(VellumError::StoreClosed)
        ));
        assert!(matches!(
            manager.fetch_bytes(RecordId(1)),
            Err(VellumError::StoreClosed)
        ));
        assert!(matches!(manager.commit(), Err(VellumError::StoreClosed)));
        assert!(matches!(manager.close(), Err(VellumError::StoreClosed)));
    }

    #[test]
    fn test_free_id_reuse_after_delete() {
        let (manager, _dir) = create_test_manager();

        let first = manager.insert_bytes(b"short lived").unwrap();
        manager.delete(first).unwrap();

        let second = manager.insert_bytes(b"recycled").unwrap();
        assert_eq!(second, first);

        let serializer = ByteArraySerializer;
        let value: Vec<u8> = manager.fetch(second, &serializer).unwrap();
        assert_eq!(value, b"recycled");
    }
}
