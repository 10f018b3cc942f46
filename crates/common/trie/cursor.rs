use crate::nibbles::Nibbles;
use crate::node::Node;
use crate::{ChildLoader, Trie, TrieError};

/// Cursor over `(packed key, value)` pairs in lexicographic key order.
///
/// The traversal materializes dummy children through the trie's loader while
/// walking, so iterating a freshly retrieved trie pulls every stored node
/// exactly once.
pub struct TrieCursor {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    next: usize,
}

impl TrieCursor {
    pub(crate) fn over(trie: &Trie) -> Result<Self, TrieError> {
        let mut entries = Vec::new();
        if let Some(root) = trie.root() {
            collect(root, &Nibbles::default(), trie.loader(), &mut entries)?;
        }
        Ok(Self { entries, next: 0 })
    }

    /// Positions the cursor at the first key >= `key`.
    /// Returns true when that key is an exact match.
    pub fn seek(&mut self, key: &[u8]) -> bool {
        self.next = self
            .entries
            .partition_point(|(entry_key, _)| entry_key.as_slice() < key);
        self.entries
            .get(self.next)
            .is_some_and(|(entry_key, _)| entry_key == key)
    }

    pub fn peek(&self) -> Option<&(Vec<u8>, Vec<u8>)> {
        self.entries.get(self.next)
    }
}

impl Iterator for TrieCursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.next).cloned();
        if entry.is_some() {
            self.next += 1;
        }
        entry
    }
}

// Depth-first walk emitting branch values before child subtrees; with packed
// byte keys this is exactly lexicographic order.
fn collect(
    node: &Node,
    prefix: &Nibbles,
    loader: Option<&ChildLoader>,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<(), TrieError> {
    match node {
        Node::Leaf(leaf) => {
            let mut full = prefix.clone();
            full.extend(&leaf.key_nibbles);
            out.push((full.to_bytes(), leaf.value.clone()));
        }
        Node::Branch(branch) => {
            let mut full = prefix.clone();
            full.extend(&branch.key_nibbles);
            if let Some(value) = &branch.value {
                out.push((full.to_bytes(), value.clone()));
            }
            for (idx, slot) in branch.children.iter().enumerate() {
                let Some(child) = slot else {
                    continue;
                };
                let mut child_prefix = full.clone();
                child_prefix.push(idx as u8);
                match child {
                    Node::Dummy(dummy) => {
                        let loader = loader.ok_or(TrieError::NoLoader)?;
                        if let Some(loaded) = loader(&dummy.db_key)? {
                            collect(&loaded, &child_prefix, Some(loader), out)?;
                        }
                    }
                    child => collect(child, &child_prefix, loader, out)?,
                }
            }
        }
        Node::Dummy(dummy) => {
            let loader = loader.ok_or(TrieError::NoLoader)?;
            if let Some(loaded) = loader(&dummy.db_key)? {
                collect(&loaded, prefix, Some(loader), out)?;
            }
        }
    }
    Ok(())
}
