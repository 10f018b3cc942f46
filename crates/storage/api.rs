//! # Storage Backend API
//!
//! Thin facade over the replicated key-value store the node keeps its chain
//! data in. The real deployment backs this with a CRDT-replicated database;
//! the contract here is deliberately small so backends stay trivial:
//!
//! - operations are idempotent keyed by their logical identifier
//! - writers publish deltas, readers observe at-least-once delivery
//! - prefix queries iterate keys in lexicographic order

use crate::error::StoreError;

/// Result of one prefix-query entry.
pub type PrefixResult = (Vec<u8>, Vec<u8>);

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn remove(&self, key: &[u8]) -> Result<(), StoreError>;

    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn query_prefix(&self, prefix: &[u8]) -> Result<Vec<PrefixResult>, StoreError>;
}
