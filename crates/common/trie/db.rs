use crate::error::TrieError;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// KV facade the trie serializer writes through. Keys are merkle values,
/// values are node encodings.
pub trait TrieBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError>;
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), TrieError>;
    fn contains(&self, key: &[u8]) -> Result<bool, TrieError> {
        Ok(self.get(key)?.is_some())
    }
    /// Writes a whole batch of nodes; a trie store is one batch per commit.
    fn put_batch(&self, key_values: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), TrieError>;
}

/// InMemory implementation for the TrieBackend trait.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTrieBackend {
    inner: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryTrieBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>) -> Self {
        Self { inner: map }
    }
}

impl TrieBackend for InMemoryTrieBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .get(key)
            .cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), TrieError> {
        self.inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .insert(key, value);
        Ok(())
    }

    fn put_batch(&self, key_values: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), TrieError> {
        let mut db = self.inner.lock().map_err(|_| TrieError::LockError)?;
        for (key, value) in key_values {
            db.insert(key, value);
        }
        Ok(())
    }
}

/// Adds a fixed byte prefix to every key before it reaches the inner store,
/// so several tries can share one physical backend.
pub struct PrefixedTrieBackend {
    prefix: Vec<u8>,
    inner: Arc<dyn TrieBackend>,
}

impl PrefixedTrieBackend {
    pub fn new(prefix: Vec<u8>, inner: Arc<dyn TrieBackend>) -> Self {
        Self { prefix, inner }
    }

    fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }
}

impl TrieBackend for PrefixedTrieBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.inner.get(&self.prefixed(key))
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), TrieError> {
        self.inner.put(self.prefixed(&key), value)
    }

    fn put_batch(&self, key_values: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), TrieError> {
        self.inner.put_batch(
            key_values
                .into_iter()
                .map(|(key, value)| (self.prefixed(&key), value))
                .collect(),
        )
    }
}
