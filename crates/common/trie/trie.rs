pub mod batch;
pub mod changes;
pub mod codec;
pub mod db;
pub mod error;
mod cursor;
mod nibbles;
mod node;
mod serializer;

use ethereum_types::H256;
use lazy_static::lazy_static;
use std::sync::Arc;

pub use self::batch::{EphemeralBatch, PersistentBatch, TopperBatch, TrieBatchMut, TrieStorage};
pub use self::changes::{ChangesTracker, ChangesTrieConfig, EXTRINSIC_INDEX_KEY};
pub use self::codec::{ordered_trie_root, Codec};
pub use self::cursor::TrieCursor;
pub use self::db::{InMemoryTrieBackend, PrefixedTrieBackend, TrieBackend};
pub use self::error::{CodecError, TrieError};
pub use self::nibbles::Nibbles;
pub use self::node::{BranchNode, DummyNode, LeafNode, Node};
pub use self::serializer::TrieSerializer;

lazy_static! {
    /// Root hash of an empty trie: blake2b-256 of the single byte 0x00.
    pub static ref EMPTY_TRIE_ROOT: H256 = Codec::hash256(&[0]);
}

/// Loads the real node behind a dummy child, given its merkle value.
/// Returns `None` when the merkle value denotes an absent subtree.
pub type ChildLoader = Arc<dyn Fn(&[u8]) -> Result<Option<Node>, TrieError> + Send + Sync>;

/// In-memory radix trie with 4-bit branching.
///
/// Children written out by the serializer are replaced with `Dummy` nodes
/// and re-materialized on demand through the configured loader, so a trie
/// opened at a stored root only ever pulls the paths it touches.
#[derive(Default)]
pub struct Trie {
    root: Option<Node>,
    loader: Option<ChildLoader>,
}

impl Trie {
    pub fn new(loader: ChildLoader) -> Self {
        Self {
            root: None,
            loader: Some(loader),
        }
    }

    pub fn from_root(root: Option<Node>, loader: ChildLoader) -> Self {
        Self {
            root,
            loader: Some(loader),
        }
    }

    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref()
    }

    pub(crate) fn root_mut(&mut self) -> &mut Option<Node> {
        &mut self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Hash identifying the current content; for a non-empty trie this is the
    /// full Blake2b-256 of the encoded root, never an inlined short encoding.
    pub fn root_hash(&self) -> Result<H256, TrieError> {
        match &self.root {
            None => Ok(*EMPTY_TRIE_ROOT),
            Some(root) => Ok(Codec::hash256(&Codec::encode_node(root)?)),
        }
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        let nibbles = Nibbles::from_bytes(key);
        let leaf = Node::leaf(nibbles.clone(), value);
        let root = self.root.take();
        self.root = Some(insert_at(root, &nibbles, leaf, self.loader.as_ref())?);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        match &self.root {
            None => Ok(None),
            Some(root) => find_value(root, &Nibbles::from_bytes(key), self.loader.as_ref()),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, TrieError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<(), TrieError> {
        if self.root.is_some() {
            let root = self.root.take();
            self.root = delete_node(root, &Nibbles::from_bytes(key), self.loader.as_ref())?;
        }
        Ok(())
    }

    /// Detaches every key starting with `prefix`; nothing else moves.
    pub fn clear_prefix(&mut self, prefix: &[u8]) -> Result<(), TrieError> {
        if self.root.is_some() {
            let root = self.root.take();
            self.root = detach_node(root, &Nibbles::from_bytes(prefix), self.loader.as_ref())?;
        }
        Ok(())
    }

    /// The `(branch key, child index)` hops leading to `key`, used to rebuild
    /// cursor state when seeking into the middle of the trie.
    pub fn path_to(&self, key: &[u8]) -> Result<Vec<(Nibbles, u8)>, TrieError> {
        let root = self.root.as_ref().ok_or(TrieError::NoValue)?;
        let mut path = Vec::new();
        collect_path(
            root,
            &Nibbles::from_bytes(key),
            self.loader.as_ref(),
            &mut path,
        )?;
        Ok(path)
    }

    /// Iterator over `(packed key, value)` in lexicographic key order.
    pub fn cursor(&self) -> Result<TrieCursor, TrieError> {
        TrieCursor::over(self)
    }

    pub(crate) fn loader(&self) -> Option<&ChildLoader> {
        self.loader.as_ref()
    }
}

fn node_value(node: Node) -> Option<Vec<u8>> {
    match node {
        Node::Leaf(leaf) => Some(leaf.value),
        Node::Branch(branch) => branch.value,
        Node::Dummy(_) => None,
    }
}

fn with_key(mut node: Node, key: Nibbles) -> Node {
    match &mut node {
        Node::Leaf(leaf) => leaf.key_nibbles = key,
        Node::Branch(branch) => branch.key_nibbles = key,
        Node::Dummy(_) => {}
    }
    node
}

fn materialize(
    slot: &mut Option<Node>,
    loader: Option<&ChildLoader>,
) -> Result<(), TrieError> {
    if let Some(Node::Dummy(dummy)) = slot {
        let loader = loader.ok_or(TrieError::NoLoader)?;
        *slot = loader(&dummy.db_key)?;
    }
    Ok(())
}

fn insert_at(
    parent: Option<Node>,
    key: &Nibbles,
    node: Node,
    loader: Option<&ChildLoader>,
) -> Result<Node, TrieError> {
    let Some(parent) = parent else {
        return Ok(with_key(node, key.clone()));
    };
    match parent {
        Node::Branch(branch) => update_branch(branch, key, node, loader),
        Node::Leaf(leaf) => {
            let length = key.common_prefix_len(&leaf.key_nibbles);

            // exact hit: the new leaf replaces the old one
            if leaf.key_nibbles == *key {
                return Ok(with_key(node, key.clone()));
            }

            let mut branch = BranchNode::new(key.slice(0, length), None);
            let parent_key = leaf.key_nibbles.clone();

            if key.len() == length {
                // the new key ends at the split point: its value lives in the
                // branch, the old leaf hangs below
                branch.value = node_value(node);
                let mut old = leaf;
                old.key_nibbles = old.key_nibbles.offset(length + 1);
                branch.children[parent_key.at(length) as usize] = Some(Node::Leaf(old));
                return Ok(Node::branch(branch));
            }

            let node = with_key(node, key.offset(length + 1));
            if length == parent_key.len() {
                // the old leaf's key ends at the split point: it becomes the
                // branch value
                branch.value = Some(leaf.value);
                branch.children[key.at(length) as usize] = Some(node);
            } else {
                let mut old = leaf;
                old.key_nibbles = old.key_nibbles.offset(length + 1);
                branch.children[parent_key.at(length) as usize] = Some(Node::Leaf(old));
                branch.children[key.at(length) as usize] = Some(node);
            }
            Ok(Node::branch(branch))
        }
        Node::Dummy(_) => {
            let mut slot = Some(parent);
            materialize(&mut slot, loader)?;
            insert_at(slot, key, node, loader)
        }
    }
}

fn update_branch(
    mut parent: Box<BranchNode>,
    key: &Nibbles,
    node: Node,
    loader: Option<&ChildLoader>,
) -> Result<Node, TrieError> {
    let length = key.common_prefix_len(&parent.key_nibbles);

    if length == parent.key_nibbles.len() {
        if *key == parent.key_nibbles {
            parent.value = node_value(node);
            return Ok(Node::Branch(parent));
        }
        let idx = key.at(length) as usize;
        materialize(&mut parent.children[idx], loader)?;
        match parent.children[idx].take() {
            Some(child) => {
                let new_child = insert_at(Some(child), &key.offset(length + 1), node, loader)?;
                parent.children[idx] = Some(new_child);
            }
            None => {
                parent.children[idx] = Some(with_key(node, key.offset(length + 1)));
            }
        }
        return Ok(Node::Branch(parent));
    }

    // the branch itself splits on a shorter common prefix
    let mut fork = BranchNode::new(key.slice(0, length), None);
    let parent_idx = parent.key_nibbles.at(length) as usize;
    parent.key_nibbles = parent.key_nibbles.offset(length + 1);
    fork.children[parent_idx] = Some(Node::Branch(parent));
    if key.len() <= length {
        fork.value = node_value(node);
    } else {
        let child_idx = key.at(length) as usize;
        fork.children[child_idx] = Some(with_key(node, key.offset(length + 1)));
    }
    Ok(Node::branch(fork))
}

fn find_value(
    node: &Node,
    key: &Nibbles,
    loader: Option<&ChildLoader>,
) -> Result<Option<Vec<u8>>, TrieError> {
    match node {
        Node::Leaf(leaf) => {
            if leaf.key_nibbles == *key {
                Ok(Some(leaf.value.clone()))
            } else {
                Ok(None)
            }
        }
        Node::Branch(branch) => {
            if branch.key_nibbles == *key || key.is_empty() {
                return Ok(branch.value.clone());
            }
            if !key.starts_with(&branch.key_nibbles) {
                return Ok(None);
            }
            let length = branch.key_nibbles.len();
            let idx = key.at(length) as usize;
            match &branch.children[idx] {
                None => Ok(None),
                Some(Node::Dummy(dummy)) => {
                    let loader = loader.ok_or(TrieError::NoLoader)?;
                    match loader(&dummy.db_key)? {
                        None => Ok(None),
                        Some(child) => find_value(&child, &key.offset(length + 1), Some(loader)),
                    }
                }
                Some(child) => find_value(child, &key.offset(length + 1), loader),
            }
        }
        Node::Dummy(dummy) => {
            let loader = loader.ok_or(TrieError::NoLoader)?;
            match loader(&dummy.db_key)? {
                None => Ok(None),
                Some(node) => find_value(&node, key, Some(loader)),
            }
        }
    }
}

fn collect_path(
    node: &Node,
    key: &Nibbles,
    loader: Option<&ChildLoader>,
    path: &mut Vec<(Nibbles, u8)>,
) -> Result<(), TrieError> {
    match node {
        Node::Leaf(leaf) => {
            if leaf.key_nibbles == *key {
                Ok(())
            } else {
                Err(TrieError::NoValue)
            }
        }
        Node::Branch(branch) => {
            if branch.key_nibbles == *key || key.is_empty() {
                return Ok(());
            }
            if !key.starts_with(&branch.key_nibbles) {
                return Err(TrieError::NoValue);
            }
            let length = branch.key_nibbles.len();
            let idx = key.at(length);
            path.push((branch.key_nibbles.clone(), idx));
            match &branch.children[idx as usize] {
                None => Err(TrieError::NoValue),
                Some(Node::Dummy(dummy)) => {
                    let loader = loader.ok_or(TrieError::NoLoader)?;
                    match loader(&dummy.db_key)? {
                        None => Err(TrieError::NoValue),
                        Some(child) => {
                            collect_path(&child, &key.offset(length + 1), Some(loader), path)
                        }
                    }
                }
                Some(child) => collect_path(child, &key.offset(length + 1), loader, path),
            }
        }
        Node::Dummy(dummy) => {
            let loader = loader.ok_or(TrieError::NoLoader)?;
            match loader(&dummy.db_key)? {
                None => Err(TrieError::NoValue),
                Some(node) => collect_path(&node, key, Some(loader), path),
            }
        }
    }
}

fn delete_node(
    node: Option<Node>,
    key: &Nibbles,
    loader: Option<&ChildLoader>,
) -> Result<Option<Node>, TrieError> {
    let Some(node) = node else {
        return Ok(None);
    };
    match node {
        Node::Leaf(leaf) => {
            if leaf.key_nibbles == *key || key.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Node::Leaf(leaf)))
            }
        }
        Node::Branch(mut branch) => {
            if branch.key_nibbles == *key || key.is_empty() {
                branch.value = None;
            } else if key.starts_with(&branch.key_nibbles) {
                let length = branch.key_nibbles.len();
                let idx = key.at(length) as usize;
                materialize(&mut branch.children[idx], loader)?;
                let child = branch.children[idx].take();
                branch.children[idx] = delete_node(child, &key.offset(length + 1), loader)?;
            } else {
                // key not present below this branch
                return Ok(Some(Node::Branch(branch)));
            }
            handle_deletion(branch, loader).map(Some)
        }
        Node::Dummy(_) => {
            let mut slot = Some(node);
            materialize(&mut slot, loader)?;
            delete_node(slot, key, loader)
        }
    }
}

/// Deletion cleanup: a branch left with no children collapses to a leaf with
/// its own value; a branch with exactly one child and no value merges into
/// that child, concatenating the keys.
fn handle_deletion(
    mut branch: Box<BranchNode>,
    loader: Option<&ChildLoader>,
) -> Result<Node, TrieError> {
    let children_num = branch.children_num();
    if children_num == 0 {
        if let Some(value) = branch.value.take() {
            return Ok(Node::leaf(branch.key_nibbles.clone(), value));
        }
        return Ok(Node::Branch(branch));
    }
    if children_num == 1 && branch.value.is_none() {
        let idx = branch
            .children
            .iter()
            .position(Option::is_some)
            .unwrap_or_default();
        materialize(&mut branch.children[idx], loader)?;
        match branch.children[idx].take() {
            Some(Node::Leaf(child)) => {
                let merged = branch.key_nibbles.join(idx as u8, &child.key_nibbles);
                return Ok(Node::leaf(merged, child.value));
            }
            Some(Node::Branch(mut child)) => {
                child.key_nibbles = branch.key_nibbles.join(idx as u8, &child.key_nibbles);
                return Ok(Node::Branch(child));
            }
            other => {
                branch.children[idx] = other;
            }
        }
    }
    Ok(Node::Branch(branch))
}

fn detach_node(
    node: Option<Node>,
    prefix: &Nibbles,
    loader: Option<&ChildLoader>,
) -> Result<Option<Node>, TrieError> {
    let Some(node) = node else {
        return Ok(None);
    };
    if let Node::Dummy(_) = node {
        let mut slot = Some(node);
        materialize(&mut slot, loader)?;
        return detach_node(slot, prefix, loader);
    }

    let key = node.key_nibbles();
    if key.len() >= prefix.len() {
        // this node is the highest one fully covered by the prefix
        if key.starts_with(prefix) {
            return Ok(None);
        }
        return Ok(Some(node));
    }
    if !prefix.starts_with(key) {
        return Ok(Some(node));
    }
    match node {
        Node::Branch(mut branch) => {
            let length = branch.key_nibbles.len();
            let idx = prefix.at(length) as usize;
            materialize(&mut branch.children[idx], loader)?;
            let child = branch.children[idx].take();
            branch.children[idx] = detach_node(child, &prefix.offset(length + 1), loader)?;
            Ok(Some(Node::Branch(branch)))
        }
        other => Ok(Some(other)),
    }
}
