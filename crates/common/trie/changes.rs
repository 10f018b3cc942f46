use ethereum_types::H256;
use std::collections::{BTreeMap, HashSet};
use taskmesh_scale::{structs::Encoder, ScaleEncode};
use tracing::warn;

use crate::codec::Codec;
use crate::{Trie, TrieError};

/// Well-known storage key holding the index of the extrinsic currently being
/// applied.
pub const EXTRINSIC_INDEX_KEY: &[u8] = b":extrinsic_index";

/// Sentinel recorded for writes that happen outside any extrinsic.
pub const NO_EXTRINSIC_INDEX: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangesTrieConfig {
    pub digest_interval: u32,
    pub digest_levels: u32,
}

// Key of a changes-trie entry: the block the change lands in plus the
// changed storage key, wrapped in the varying datatype whose indexing
// starts at 1.
struct ExtrinsicsChangesKey<'a> {
    block: u64,
    key: &'a [u8],
}

impl ScaleEncode for ExtrinsicsChangesKey<'_> {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_tag(1)
            .encode_field(&self.block)
            .encode_field(&self.key.to_vec())
            .finish();
    }
}

/// Records which extrinsics touched which storage keys inside the persistent
/// batch of the block being built.
#[derive(Debug, Default)]
pub struct ChangesTracker {
    extrinsics_changes: BTreeMap<Vec<u8>, Vec<u32>>,
    // keys that do not exist in the underlying storage yet, so the first
    // write is a create rather than an update
    new_entries: HashSet<Vec<u8>>,
    parent_hash: H256,
    parent_number: u64,
}

impl ChangesTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent(&self) -> (H256, u64) {
        (self.parent_hash, self.parent_number)
    }

    /// Starts tracking for a new block; pending changes of the previous one
    /// are dropped.
    pub fn on_block_change(&mut self, new_parent_hash: H256, new_parent_number: u64) {
        self.extrinsics_changes.clear();
        self.new_entries.clear();
        self.parent_hash = new_parent_hash;
        self.parent_number = new_parent_number;
    }

    pub fn on_put(&mut self, extrinsic_index: u32, key: &[u8], new_entry: bool) {
        if new_entry {
            self.new_entries.insert(key.to_vec());
        }
        self.extrinsics_changes
            .entry(key.to_vec())
            .or_default()
            .push(extrinsic_index);
    }

    pub fn on_remove(&mut self, extrinsic_index: u32, key: &[u8]) {
        if self.new_entries.remove(key) {
            // created and removed within the same block: net zero
            self.extrinsics_changes.remove(key);
        } else {
            self.extrinsics_changes
                .entry(key.to_vec())
                .or_default()
                .push(extrinsic_index);
        }
    }

    /// Builds the changes trie for the block on top of `parent` and returns
    /// its root hash.
    pub fn construct_changes_trie(
        &self,
        parent: H256,
        _config: &ChangesTrieConfig,
    ) -> Result<H256, TrieError> {
        if parent != self.parent_hash {
            warn!(
                expected = %self.parent_hash,
                got = %parent,
                "changes trie requested for a different parent"
            );
            return Err(TrieError::InvalidInput);
        }
        let block = self.parent_number + 1;
        let mut trie = Trie::default();
        for (key, extrinsics) in &self.extrinsics_changes {
            let key_enc = ExtrinsicsChangesKey {
                block,
                key: key.as_slice(),
            }
            .encode_to_vec();
            trie.put(&key_enc, extrinsics.encode_to_vec())?;
        }
        match trie.root() {
            None => Ok(Codec::hash256(&[0])),
            Some(root) => Ok(Codec::hash256(&Codec::encode_node(root)?)),
        }
    }
}
