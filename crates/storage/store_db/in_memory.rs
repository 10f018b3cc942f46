use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crate::api::{KvStore, PrefixResult};
use crate::error::StoreError;

/// In-memory implementation of [`KvStore`].
///
/// The ordered map makes prefix queries range scans, mirroring how the
/// replicated store namespaces keys hierarchically.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKvStore {
    inner: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| StoreError::LockError)?
            .get(key)
            .cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::LockError)?
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::LockError)?
            .remove(key);
        Ok(())
    }

    fn query_prefix(&self, prefix: &[u8]) -> Result<Vec<PrefixResult>, StoreError> {
        let db = self.inner.lock().map_err(|_| StoreError::LockError)?;
        Ok(db
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
