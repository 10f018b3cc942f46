use ethereum_types::H256;
use std::sync::Arc;

use crate::codec::Codec;
use crate::db::TrieBackend;
use crate::node::Node;
use crate::{ChildLoader, Trie, TrieError, EMPTY_TRIE_ROOT};

/// Moves tries between their in-memory and stored forms.
///
/// Storing walks the node graph depth-first: children are written before
/// their parent (their merkle values are part of the parent's encoding) and
/// each written child is replaced in memory with a dummy reference.
pub struct TrieSerializer {
    backend: Arc<dyn TrieBackend>,
}

impl TrieSerializer {
    pub fn new(backend: Arc<dyn TrieBackend>) -> Self {
        Self { backend }
    }

    pub fn empty_root_hash() -> H256 {
        *EMPTY_TRIE_ROOT
    }

    /// Writes every in-memory node of `trie` and returns the new root hash.
    /// The root hash is always the full Blake2b-256, never an inlined short
    /// encoding.
    pub fn store(&self, trie: &mut Trie) -> Result<H256, TrieError> {
        let Some(root) = trie.root_mut().as_mut() else {
            return Ok(Self::empty_root_hash());
        };
        let mut batch = Vec::new();
        if let Node::Branch(branch) = root {
            store_children(branch, &mut batch)?;
        }
        let encoding = Codec::encode_node(root)?;
        let root_hash = Codec::hash256(&encoding);
        batch.push((root_hash.as_bytes().to_vec(), encoding));
        self.backend.put_batch(batch)?;
        Ok(root_hash)
    }

    /// Opens the trie stored under `root_hash`, wiring a loader that pulls
    /// dummy children from the backend on demand.
    pub fn retrieve(&self, root_hash: H256) -> Result<Trie, TrieError> {
        let loader = self.loader();
        if root_hash == Self::empty_root_hash() {
            return Ok(Trie::new(loader));
        }
        let root = self
            .retrieve_node(root_hash.as_bytes())?
            .ok_or_else(|| TrieError::NodeNotFound(hex::encode(root_hash)))?;
        Ok(Trie::from_root(Some(root), loader))
    }

    pub fn retrieve_node(&self, db_key: &[u8]) -> Result<Option<Node>, TrieError> {
        if db_key.is_empty() || db_key == Self::empty_root_hash().as_bytes() {
            return Ok(None);
        }
        // short merkle values inline the encoding itself
        let encoding = if db_key.len() < 32 {
            db_key.to_vec()
        } else {
            self.backend
                .get(db_key)?
                .ok_or_else(|| TrieError::NodeNotFound(hex::encode(db_key)))?
        };
        Ok(Some(Codec::decode_node(&encoding)?))
    }

    pub fn loader(&self) -> ChildLoader {
        let backend = self.backend.clone();
        Arc::new(move |db_key: &[u8]| {
            if db_key.is_empty() || db_key == EMPTY_TRIE_ROOT.as_bytes() {
                return Ok(None);
            }
            let encoding = if db_key.len() < 32 {
                db_key.to_vec()
            } else {
                backend
                    .get(db_key)?
                    .ok_or_else(|| TrieError::NodeNotFound(hex::encode(db_key)))?
            };
            Ok(Some(Codec::decode_node(&encoding)?))
        })
    }
}

fn store_node(node: &mut Node, batch: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<u8>, TrieError> {
    if let Node::Branch(branch) = node {
        store_children(branch, batch)?;
    }
    let encoding = Codec::encode_node(node)?;
    let merkle_value = Codec::merkle_value(&encoding);
    batch.push((merkle_value.clone(), encoding));
    Ok(merkle_value)
}

fn store_children(
    branch: &mut crate::node::BranchNode,
    batch: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<(), TrieError> {
    for slot in branch.children.iter_mut() {
        if let Some(child) = slot {
            if !child.is_dummy() {
                let merkle_value = store_node(child, batch)?;
                // written nodes are kept only as references from here on
                *slot = Some(Node::dummy(merkle_value));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryTrieBackend;

    fn serializer() -> TrieSerializer {
        TrieSerializer::new(Arc::new(InMemoryTrieBackend::new()))
    }

    #[test]
    fn store_then_retrieve_preserves_content() {
        let serializer = serializer();
        let mut trie = Trie::default();
        trie.put(b"123", b"abc".to_vec()).expect("insertion");
        trie.put(b"345", b"def".to_vec()).expect("insertion");
        trie.put(b"678", b"xyz".to_vec()).expect("insertion");
        let root = serializer.store(&mut trie).expect("store");

        let reopened = serializer.retrieve(root).expect("retrieve");
        assert_eq!(reopened.get(b"123").expect("get"), Some(b"abc".to_vec()));
        assert_eq!(reopened.get(b"345").expect("get"), Some(b"def".to_vec()));
        assert_eq!(reopened.get(b"678").expect("get"), Some(b"xyz".to_vec()));
        assert_eq!(reopened.get(b"999").expect("get"), None);
    }

    #[test]
    fn storing_demotes_children_to_dummies() {
        let serializer = serializer();
        let mut trie = serializer.retrieve(*EMPTY_TRIE_ROOT).expect("retrieve");
        trie.put(b"abc", b"1".to_vec()).expect("insertion");
        trie.put(b"abd", b"2".to_vec()).expect("insertion");
        serializer.store(&mut trie).expect("store");

        let Some(Node::Branch(root)) = trie.root() else {
            panic!("expected a branch root");
        };
        assert!(root
            .children
            .iter()
            .flatten()
            .all(|child| child.is_dummy()));
        // reads after a store go through the loader transparently
        assert_eq!(trie.get(b"abc").expect("get"), Some(b"1".to_vec()));
    }

    #[test]
    fn empty_trie_stores_to_the_well_known_root() {
        let serializer = serializer();
        let mut trie = Trie::default();
        assert_eq!(serializer.store(&mut trie).expect("store"), *EMPTY_TRIE_ROOT);
        let reopened = serializer.retrieve(*EMPTY_TRIE_ROOT).expect("retrieve");
        assert!(reopened.is_empty());
    }

    #[test]
    fn retrieving_an_unknown_root_fails() {
        let serializer = serializer();
        assert!(matches!(
            serializer.retrieve(H256::repeat_byte(0x99)),
            Err(TrieError::NodeNotFound(_))
        ));
    }

    #[test]
    fn old_roots_stay_addressable_after_new_commits() {
        let serializer = serializer();
        let mut trie = Trie::default();
        trie.put(b"k", b"v1".to_vec()).expect("insertion");
        let root_one = serializer.store(&mut trie).expect("store");

        let mut forked = serializer.retrieve(root_one).expect("retrieve");
        forked.put(b"k", b"v2".to_vec()).expect("insertion");
        let root_two = serializer.store(&mut forked).expect("store");
        assert_ne!(root_one, root_two);

        let old = serializer.retrieve(root_one).expect("retrieve");
        assert_eq!(old.get(b"k").expect("get"), Some(b"v1".to_vec()));
        let new = serializer.retrieve(root_two).expect("retrieve");
        assert_eq!(new.get(b"k").expect("get"), Some(b"v2".to_vec()));
    }
}
