use ethereum_types::H256;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use taskmesh_common::{Block, BlockBody, BlockHeader, BlockId, BlockInfo, BlockNumber, Justification};
use taskmesh_storage::BlockStorage;
use tracing::{debug, error, info};

use crate::error::ChainError;

/// Ancestry checks exposed to collaborators that must not hold the whole
/// tree (authority scheduler, finality rounds).
pub trait AncestryProvider {
    /// true iff `descendant` is reachable from `ancestor` by child links
    /// (a block is its own ancestor).
    fn has_direct_chain(&self, ancestor: &H256, descendant: &H256) -> bool;
}

/// Notified after the finalized tip advances.
pub trait FinalizationObserver: Send + Sync {
    fn on_finalize(&self, block: &BlockInfo, ancestry: &dyn AncestryProvider);
}

#[derive(Debug)]
struct TreeNode {
    number: BlockNumber,
    parent: Option<H256>,
    children: Vec<H256>,
}

/// Fork-aware tree of the blocks above the last finalized one.
///
/// Nodes are owned by the tree and addressed by hash; storage writes go
/// through the block storage so the in-memory view never diverges from the
/// KV store.
pub struct BlockTree {
    storage: Arc<BlockStorage>,
    nodes: HashMap<H256, TreeNode>,
    finalized: BlockInfo,
    observers: Vec<Arc<dyn FinalizationObserver>>,
}

impl BlockTree {
    /// Builds a tree rooted at the storage's last finalized block.
    pub fn new(storage: Arc<BlockStorage>) -> Result<Self, ChainError> {
        let last = storage.last_finalized_block_hash()?;
        let header = storage.get_block_header(&BlockId::Hash(last))?;
        let mut nodes = HashMap::new();
        nodes.insert(
            last,
            TreeNode {
                number: header.number,
                parent: None,
                children: Vec::new(),
            },
        );
        Ok(Self {
            storage,
            nodes,
            finalized: BlockInfo::new(header.number, last),
            observers: Vec::new(),
        })
    }

    pub fn add_observer(&mut self, observer: Arc<dyn FinalizationObserver>) {
        self.observers.push(observer);
    }

    pub fn get_block_header(&self, id: &BlockId) -> Result<BlockHeader, ChainError> {
        Ok(self.storage.get_block_header(id)?)
    }

    pub fn get_block_body(&self, id: &BlockId) -> Result<BlockBody, ChainError> {
        Ok(self.storage.get_block_body(id)?)
    }

    pub fn get_block_justification(&self, id: &BlockId) -> Result<Justification, ChainError> {
        Ok(self.storage.get_justification(id)?)
    }

    /// Inserts a header whose parent is already in the tree. A missing
    /// parent is reported to the caller, who typically triggers a sync.
    pub fn add_block_header(&mut self, header: &BlockHeader) -> Result<H256, ChainError> {
        let hash = header.hash();
        if self.nodes.contains_key(&hash) {
            return Ok(hash);
        }
        if !self.nodes.contains_key(&header.parent_hash) {
            debug!(block = %hash, parent = %header.parent_hash, "parent not in tree");
            return Err(ChainError::ParentNotFound);
        }
        self.storage.put_block_header(header)?;
        self.attach(hash, header);
        Ok(hash)
    }

    pub fn add_block_body(
        &mut self,
        number: BlockNumber,
        hash: &H256,
        body: &BlockBody,
    ) -> Result<(), ChainError> {
        Ok(self.storage.put_block_body(number, hash, body)?)
    }

    /// Header then body, atomically: nothing is written if the parent is
    /// missing.
    pub fn add_block(&mut self, block: &Block) -> Result<H256, ChainError> {
        if !self.nodes.contains_key(&block.header.parent_hash) {
            return Err(ChainError::ParentNotFound);
        }
        let hash = self.storage.put_block(block)?;
        self.attach(hash, &block.header);
        Ok(hash)
    }

    fn attach(&mut self, hash: H256, header: &BlockHeader) {
        self.nodes.insert(
            hash,
            TreeNode {
                number: header.number,
                parent: Some(header.parent_hash),
                children: Vec::new(),
            },
        );
        if let Some(parent) = self.nodes.get_mut(&header.parent_hash) {
            parent.children.push(hash);
        }
    }

    /// Marks `hash` as finalized: stores the justification, prunes every
    /// branch not descending from it and advances the finalized tip.
    pub fn finalize(
        &mut self,
        hash: &H256,
        justification: &Justification,
    ) -> Result<(), ChainError> {
        let node = self
            .nodes
            .get(hash)
            .ok_or(ChainError::BlockNotFound(*hash))?;
        if !self.has_direct_chain(&self.finalized.hash, hash) {
            error!(block = %hash, finalized = %self.finalized.hash,
                "refusing to finalize a non-descendant of the finalized tip");
            return Err(ChainError::NotDescendant(*hash));
        }
        let number = node.number;
        self.storage.put_justification(justification, hash, number)?;

        // the finalized chain leaves the in-memory tree but stays in storage;
        // abandoned forks are removed from both
        let keep = self.subtree_of(hash);
        let chain_to_new_tip: HashSet<H256> = self.chain_between(&self.finalized.hash, hash);
        let pruned: Vec<(H256, BlockNumber)> = self
            .nodes
            .iter()
            .filter(|(node_hash, _)| {
                !keep.contains(*node_hash) && !chain_to_new_tip.contains(*node_hash)
            })
            .map(|(node_hash, node)| (*node_hash, node.number))
            .collect();
        for (pruned_hash, pruned_number) in &pruned {
            debug!(block = %pruned_hash, "pruning abandoned fork block");
            self.storage.remove_block(pruned_hash, *pruned_number)?;
        }
        self.nodes
            .retain(|node_hash, _| keep.contains(node_hash));
        if let Some(new_root) = self.nodes.get_mut(hash) {
            new_root.parent = None;
        }

        self.finalized = BlockInfo::new(number, *hash);
        self.storage.set_last_finalized_block_hash(hash)?;
        info!(block = %hash, number, "finalized");

        let finalized = self.finalized;
        for observer in self.observers.clone() {
            observer.on_finalize(&finalized, self);
        }
        Ok(())
    }

    /// Chain from the last finalized block down to `hash`, in
    /// top-to-bottom order.
    pub fn get_chain_by_block(&self, hash: &H256) -> Result<Vec<H256>, ChainError> {
        self.get_chain_by_blocks(&self.finalized.hash, hash)
    }

    /// Chain starting at `hash`; ascending walks toward the deepest leaf,
    /// descending toward the finalized root. At most `maximum` entries.
    pub fn get_chain_by_block_dir(
        &self,
        hash: &H256,
        ascending: bool,
        maximum: u64,
    ) -> Result<Vec<H256>, ChainError> {
        if !self.nodes.contains_key(hash) {
            return Err(ChainError::BlockNotFound(*hash));
        }
        let mut chain = vec![*hash];
        if ascending {
            let deepest = self.deepest_leaf().hash;
            let full = self.chain_between_vec(hash, &deepest)?;
            chain = full.into_iter().take(maximum as usize).collect();
        } else {
            let mut current = *hash;
            while chain.len() < maximum as usize {
                let Some(parent) = self.nodes.get(&current).and_then(|node| node.parent) else {
                    break;
                };
                chain.push(parent);
                current = parent;
            }
        }
        Ok(chain)
    }

    /// Chain from `top` down to `bottom`, in top-to-bottom order.
    pub fn get_chain_by_blocks(
        &self,
        top: &H256,
        bottom: &H256,
    ) -> Result<Vec<H256>, ChainError> {
        self.chain_between_vec(top, bottom)
    }

    pub fn has_direct_chain(&self, ancestor: &H256, descendant: &H256) -> bool {
        if ancestor == descendant {
            return self.nodes.contains_key(ancestor);
        }
        let mut current = *descendant;
        while let Some(node) = self.nodes.get(&current) {
            match node.parent {
                Some(parent) if parent == *ancestor => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// Chain from the finalized tip to the deepest leaf; ties on depth are
    /// broken deterministically by hash order.
    pub fn longest_path(&self) -> Result<Vec<H256>, ChainError> {
        let deepest = self.deepest_leaf();
        self.chain_between_vec(&self.finalized.hash, &deepest.hash)
    }

    pub fn deepest_leaf(&self) -> BlockInfo {
        let mut best = self.finalized;
        for hash in self.leaf_hashes() {
            let number = self.nodes[&hash].number;
            if number > best.number || (number == best.number && hash < best.hash) {
                best = BlockInfo::new(number, hash);
            }
        }
        best
    }

    /// Deepest leaf whose chain contains `target`, bounded by `max_number`.
    pub fn get_best_containing(
        &self,
        target: &H256,
        max_number: Option<BlockNumber>,
    ) -> Result<BlockInfo, ChainError> {
        if !self.nodes.contains_key(target) {
            return Err(ChainError::BlockNotFound(*target));
        }
        let mut best: Option<BlockInfo> = None;
        for leaf in self.leaf_hashes() {
            if !self.has_direct_chain(target, &leaf) {
                continue;
            }
            // walk up the leaf's chain until under the number bound
            let mut current = leaf;
            loop {
                let node = &self.nodes[&current];
                if max_number.map_or(true, |max| node.number <= max) {
                    let candidate = BlockInfo::new(node.number, current);
                    let better = match best {
                        None => true,
                        Some(chosen) => {
                            candidate.number > chosen.number
                                || (candidate.number == chosen.number
                                    && candidate.hash < chosen.hash)
                        }
                    };
                    if better && self.has_direct_chain(target, &current) {
                        best = Some(candidate);
                    }
                    break;
                }
                match node.parent {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
        }
        best.ok_or(ChainError::BlockNotFound(*target))
    }

    pub fn get_leaves(&self) -> Vec<H256> {
        self.leaf_hashes()
    }

    pub fn get_children(&self, hash: &H256) -> Result<Vec<H256>, ChainError> {
        self.nodes
            .get(hash)
            .map(|node| node.children.clone())
            .ok_or(ChainError::BlockNotFound(*hash))
    }

    pub fn get_last_finalized(&self) -> BlockInfo {
        self.finalized
    }

    fn leaf_hashes(&self) -> Vec<H256> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.children.is_empty())
            .map(|(hash, _)| *hash)
            .collect()
    }

    fn subtree_of(&self, root: &H256) -> HashSet<H256> {
        let mut keep = HashSet::new();
        let mut stack = vec![*root];
        while let Some(hash) = stack.pop() {
            if let Some(node) = self.nodes.get(&hash) {
                keep.insert(hash);
                stack.extend(node.children.iter().copied());
            }
        }
        keep
    }

    fn chain_between(&self, top: &H256, bottom: &H256) -> HashSet<H256> {
        self.chain_between_vec(top, bottom)
            .map(|chain| chain.into_iter().collect())
            .unwrap_or_default()
    }

    fn chain_between_vec(&self, top: &H256, bottom: &H256) -> Result<Vec<H256>, ChainError> {
        let mut chain = vec![*bottom];
        let mut current = *bottom;
        while current != *top {
            let node = self
                .nodes
                .get(&current)
                .ok_or(ChainError::BlockNotFound(current))?;
            let parent = node.parent.ok_or(ChainError::BlockNotFound(*top))?;
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        Ok(chain)
    }
}

impl AncestryProvider for BlockTree {
    fn has_direct_chain(&self, ancestor: &H256, descendant: &H256) -> bool {
        BlockTree::has_direct_chain(self, ancestor, descendant)
    }
}
