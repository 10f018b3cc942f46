use ethereum_types::H256;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use taskmesh_scale::ScaleDecode;

use crate::changes::{ChangesTracker, EXTRINSIC_INDEX_KEY, NO_EXTRINSIC_INDEX};
use crate::cursor::TrieCursor;
use crate::serializer::TrieSerializer;
use crate::{Trie, TrieError};

/// Read/write surface shared by all batch kinds.
pub trait TrieBatchMut: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError>;
    fn contains(&self, key: &[u8]) -> Result<bool, TrieError> {
        Ok(self.get(key)?.is_some())
    }
    fn is_empty(&self) -> bool;
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError>;
    fn remove(&mut self, key: &[u8]) -> Result<(), TrieError>;
    fn clear_prefix(&mut self, prefix: &[u8]) -> Result<(), TrieError>;
}

/// Entry point for state access: hands out batches pinned to a root hash.
///
/// Only one persistent batch may be open at a time; ephemeral batches may
/// coexist at arbitrary roots. Committing a persistent batch opened at an
/// older root forks the state; the overwritten root stays addressable in the
/// backend.
pub struct TrieStorage {
    serializer: Arc<TrieSerializer>,
    tracker: Option<Arc<Mutex<ChangesTracker>>>,
    root: Arc<Mutex<H256>>,
    persistent_open: Arc<AtomicBool>,
}

impl TrieStorage {
    pub fn empty(
        serializer: Arc<TrieSerializer>,
        tracker: Option<Arc<Mutex<ChangesTracker>>>,
    ) -> Self {
        Self::from_root(serializer, tracker, TrieSerializer::empty_root_hash())
    }

    pub fn from_root(
        serializer: Arc<TrieSerializer>,
        tracker: Option<Arc<Mutex<ChangesTracker>>>,
        root: H256,
    ) -> Self {
        Self {
            serializer,
            tracker,
            root: Arc::new(Mutex::new(root)),
            persistent_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root(&self) -> Result<H256, TrieError> {
        Ok(*self.root.lock().map_err(|_| TrieError::LockError)?)
    }

    pub fn persistent_batch(&self) -> Result<PersistentBatch, TrieError> {
        let root = self.root()?;
        self.persistent_batch_at(root)
    }

    pub fn persistent_batch_at(&self, root: H256) -> Result<PersistentBatch, TrieError> {
        if self.persistent_open.swap(true, Ordering::SeqCst) {
            return Err(TrieError::BatchInUse);
        }
        let trie = match self.serializer.retrieve(root) {
            Ok(trie) => trie,
            Err(err) => {
                self.persistent_open.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        Ok(PersistentBatch {
            trie,
            serializer: self.serializer.clone(),
            tracker: self.tracker.clone(),
            root: self.root.clone(),
            open: self.persistent_open.clone(),
        })
    }

    pub fn ephemeral_batch(&self) -> Result<EphemeralBatch, TrieError> {
        let root = self.root()?;
        self.ephemeral_batch_at(root)
    }

    pub fn ephemeral_batch_at(&self, root: H256) -> Result<EphemeralBatch, TrieError> {
        Ok(EphemeralBatch {
            trie: self.serializer.retrieve(root)?,
        })
    }
}

/// Scratch state view: mutations die with the batch.
pub struct EphemeralBatch {
    trie: Trie,
}

impl EphemeralBatch {
    pub fn cursor(&self) -> Result<TrieCursor, TrieError> {
        self.trie.cursor()
    }
}

impl TrieBatchMut for EphemeralBatch {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.trie.get(key)
    }

    fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        self.trie.put(key, value)
    }

    fn remove(&mut self, key: &[u8]) -> Result<(), TrieError> {
        self.trie.remove(key)
    }

    fn clear_prefix(&mut self, prefix: &[u8]) -> Result<(), TrieError> {
        self.trie.clear_prefix(prefix)
    }
}

/// State-mutating session whose commit advances the canonical root.
///
/// Every write is reported to the changes tracker together with the
/// extrinsic index found under `:extrinsic_index` at the time of the write.
pub struct PersistentBatch {
    trie: Trie,
    serializer: Arc<TrieSerializer>,
    tracker: Option<Arc<Mutex<ChangesTracker>>>,
    root: Arc<Mutex<H256>>,
    open: Arc<AtomicBool>,
}

impl PersistentBatch {
    pub fn cursor(&self) -> Result<TrieCursor, TrieError> {
        self.trie.cursor()
    }

    /// Writes the trie out and publishes the new root hash.
    pub fn commit(mut self) -> Result<H256, TrieError> {
        let new_root = self.serializer.store(&mut self.trie)?;
        *self.root.lock().map_err(|_| TrieError::LockError)? = new_root;
        Ok(new_root)
    }

    // runtime-internal writes happen outside any extrinsic and are recorded
    // under the sentinel index
    fn current_extrinsic_index(&self) -> u32 {
        match self.trie.get(EXTRINSIC_INDEX_KEY) {
            Ok(Some(value)) => u32::decode(&value).unwrap_or(NO_EXTRINSIC_INDEX),
            _ => NO_EXTRINSIC_INDEX,
        }
    }
}

impl TrieBatchMut for PersistentBatch {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.trie.get(key)
    }

    fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        let is_new_entry = !self.trie.contains(key)?;
        self.trie.put(key, value)?;
        if let Some(tracker) = &self.tracker {
            let index = self.current_extrinsic_index();
            tracker
                .lock()
                .map_err(|_| TrieError::LockError)?
                .on_put(index, key, is_new_entry);
        }
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<(), TrieError> {
        self.trie.remove(key)?;
        if let Some(tracker) = &self.tracker {
            let index = self.current_extrinsic_index();
            tracker
                .lock()
                .map_err(|_| TrieError::LockError)?
                .on_remove(index, key);
        }
        Ok(())
    }

    fn clear_prefix(&mut self, prefix: &[u8]) -> Result<(), TrieError> {
        self.trie.clear_prefix(prefix)
    }
}

impl Drop for PersistentBatch {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

enum TopperOp {
    Put(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
    ClearPrefix(Vec<u8>),
}

/// Stacked batch containing the effects of a single extrinsic; nothing
/// reaches the parent until `write_back`.
pub struct TopperBatch {
    parent: Weak<Mutex<dyn TrieBatchMut>>,
    cache: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared_prefixes: Vec<Vec<u8>>,
    ops: Vec<TopperOp>,
}

impl TopperBatch {
    pub fn new(parent: &Arc<Mutex<dyn TrieBatchMut>>) -> Self {
        Self {
            parent: Arc::downgrade(parent),
            cache: BTreeMap::new(),
            cleared_prefixes: Vec::new(),
            ops: Vec::new(),
        }
    }

    fn was_cleared_by_prefix(&self, key: &[u8]) -> bool {
        self.cleared_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix))
    }

    fn parent(&self) -> Result<Arc<Mutex<dyn TrieBatchMut>>, TrieError> {
        self.parent.upgrade().ok_or(TrieError::ParentExpired)
    }

    /// Replays the buffered operations into the parent, in the order they
    /// were issued.
    pub fn write_back(self) -> Result<(), TrieError> {
        let parent = self.parent()?;
        let mut parent = parent.lock().map_err(|_| TrieError::LockError)?;
        for op in self.ops {
            match op {
                TopperOp::Put(key, value) => parent.put(&key, value)?,
                TopperOp::Remove(key) => parent.remove(&key)?,
                TopperOp::ClearPrefix(prefix) => parent.clear_prefix(&prefix)?,
            }
        }
        Ok(())
    }
}

impl TrieBatchMut for TopperBatch {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        if let Some(buffered) = self.cache.get(key) {
            return Ok(buffered.clone());
        }
        if self.was_cleared_by_prefix(key) {
            return Ok(None);
        }
        let parent = self.parent()?;
        let parent = parent.lock().map_err(|_| TrieError::LockError)?;
        parent.get(key)
    }

    fn is_empty(&self) -> bool {
        self.cache.values().all(Option::is_none)
            && self
                .parent
                .upgrade()
                .and_then(|parent| parent.lock().ok().map(|parent| parent.is_empty()))
                .unwrap_or(true)
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        self.cache.insert(key.to_vec(), Some(value.clone()));
        self.ops.push(TopperOp::Put(key.to_vec(), value));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<(), TrieError> {
        self.cache.insert(key.to_vec(), None);
        self.ops.push(TopperOp::Remove(key.to_vec()));
        Ok(())
    }

    fn clear_prefix(&mut self, prefix: &[u8]) -> Result<(), TrieError> {
        self.cache.retain(|key, _| !key.starts_with(prefix));
        self.cleared_prefixes.push(prefix.to_vec());
        self.ops.push(TopperOp::ClearPrefix(prefix.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryTrieBackend;

    fn storage() -> TrieStorage {
        let serializer = Arc::new(TrieSerializer::new(Arc::new(InMemoryTrieBackend::new())));
        TrieStorage::empty(serializer, None)
    }

    #[test]
    fn persistent_commit_advances_the_root() {
        let storage = storage();
        let initial = storage.root().expect("root");

        let mut batch = storage.persistent_batch().expect("batch");
        batch.put(b"key", b"value".to_vec()).expect("put");
        let committed = batch.commit().expect("commit");

        assert_ne!(committed, initial);
        assert_eq!(storage.root().expect("root"), committed);

        let reopened = storage.ephemeral_batch().expect("batch");
        assert_eq!(reopened.get(b"key").expect("get"), Some(b"value".to_vec()));
    }

    #[test]
    fn only_one_persistent_batch_at_a_time() {
        let storage = storage();
        let batch = storage.persistent_batch().expect("batch");
        assert!(matches!(
            storage.persistent_batch(),
            Err(TrieError::BatchInUse)
        ));
        drop(batch);
        assert!(storage.persistent_batch().is_ok());
    }

    #[test]
    fn ephemeral_changes_are_discarded() {
        let storage = storage();
        {
            let mut batch = storage.ephemeral_batch().expect("batch");
            batch.put(b"gone", b"soon".to_vec()).expect("put");
            assert_eq!(batch.get(b"gone").expect("get"), Some(b"soon".to_vec()));
        }
        let fresh = storage.ephemeral_batch().expect("batch");
        assert_eq!(fresh.get(b"gone").expect("get"), None);
    }

    #[test]
    fn committing_at_an_older_root_forks_state() {
        let storage = storage();
        let mut batch = storage.persistent_batch().expect("batch");
        batch.put(b"k", b"v1".to_vec()).expect("put");
        let first = batch.commit().expect("commit");

        let mut fork = storage
            .persistent_batch_at(TrieSerializer::empty_root_hash())
            .expect("batch");
        fork.put(b"k", b"v2".to_vec()).expect("put");
        let second = fork.commit().expect("commit");
        assert_ne!(first, second);

        // both roots resolve
        let old = storage.ephemeral_batch_at(first).expect("batch");
        assert_eq!(old.get(b"k").expect("get"), Some(b"v1".to_vec()));
        let new = storage.ephemeral_batch_at(second).expect("batch");
        assert_eq!(new.get(b"k").expect("get"), Some(b"v2".to_vec()));
    }

    #[test]
    fn topper_buffers_until_write_back() {
        let storage = storage();
        let parent: Arc<Mutex<dyn TrieBatchMut>> =
            Arc::new(Mutex::new(storage.persistent_batch().expect("batch")));
        {
            let mut guard = parent.lock().expect("lock");
            guard.put(b"base", b"0".to_vec()).expect("put");
        }

        let mut topper = TopperBatch::new(&parent);
        topper.put(b"extra", b"1".to_vec()).expect("put");
        topper.remove(b"base").expect("remove");

        // reads consult the buffer first, then the parent
        assert_eq!(topper.get(b"extra").expect("get"), Some(b"1".to_vec()));
        assert_eq!(topper.get(b"base").expect("get"), None);
        {
            let guard = parent.lock().expect("lock");
            assert_eq!(guard.get(b"base").expect("get"), Some(b"0".to_vec()));
            assert_eq!(guard.get(b"extra").expect("get"), None);
        }

        topper.write_back().expect("write back");
        let guard = parent.lock().expect("lock");
        assert_eq!(guard.get(b"base").expect("get"), None);
        assert_eq!(guard.get(b"extra").expect("get"), Some(b"1".to_vec()));
    }

    #[test]
    fn topper_treats_cleared_prefixes_as_absent() {
        let storage = storage();
        let parent: Arc<Mutex<dyn TrieBatchMut>> =
            Arc::new(Mutex::new(storage.persistent_batch().expect("batch")));
        {
            let mut guard = parent.lock().expect("lock");
            guard.put(b"task/1", b"a".to_vec()).expect("put");
            guard.put(b"task/2", b"b".to_vec()).expect("put");
            guard.put(b"other", b"c".to_vec()).expect("put");
        }

        let mut topper = TopperBatch::new(&parent);
        topper.clear_prefix(b"task/").expect("clear");
        assert_eq!(topper.get(b"task/1").expect("get"), None);
        assert_eq!(topper.get(b"other").expect("get"), Some(b"c".to_vec()));

        topper.write_back().expect("write back");
        let guard = parent.lock().expect("lock");
        assert_eq!(guard.get(b"task/2").expect("get"), None);
        assert_eq!(guard.get(b"other").expect("get"), Some(b"c".to_vec()));
    }

    #[test]
    fn topper_outliving_its_parent_fails() {
        let storage = storage();
        let parent: Arc<Mutex<dyn TrieBatchMut>> =
            Arc::new(Mutex::new(storage.persistent_batch().expect("batch")));
        let mut topper = TopperBatch::new(&parent);
        topper.put(b"k", b"v".to_vec()).expect("put");
        drop(parent);
        assert!(matches!(topper.get(b"k"), Ok(Some(_))));
        assert!(matches!(
            topper.get(b"unbuffered"),
            Err(TrieError::ParentExpired)
        ));
        assert!(matches!(topper.write_back(), Err(TrieError::ParentExpired)));
    }
}
