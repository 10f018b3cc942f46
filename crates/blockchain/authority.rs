use std::sync::{Arc, RwLock};
use taskmesh_common::{
    AuthorityList, BlockInfo, BlockNumber, VerificationDigest,
};
use taskmesh_scale::{
    structs::{Decoder, Encoder},
    ScaleDecode, ScaleDecodeError, ScaleEncode,
};
use taskmesh_storage::KvStore;
use tracing::{debug, info};

use crate::error::AuthorityError;
use crate::tree::{AncestryProvider, FinalizationObserver};

/// Key the scheduler tree is persisted under, so it survives restarts.
pub const SCHEDULER_TREE_KEY: &[u8] = b"authority_tree";

/// One node of the scheduler tree: the authority set effective at `block`
/// plus any transition announced there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleNode {
    pub block: BlockInfo,
    pub authorities: AuthorityList,
    pub enabled: bool,
    pub scheduled_after: Option<(BlockNumber, AuthorityList)>,
    pub forced_for: Option<(BlockNumber, AuthorityList)>,
    pub pause_after: Option<BlockNumber>,
    pub resume_for: Option<BlockNumber>,
    pub descendants: Vec<ScheduleNode>,
}

impl ScheduleNode {
    pub fn root(block: BlockInfo, authorities: AuthorityList) -> Self {
        Self {
            block,
            authorities,
            enabled: true,
            scheduled_after: None,
            forced_for: None,
            pause_after: None,
            resume_for: None,
            descendants: Vec::new(),
        }
    }

    /// Child inheriting this node's effective state at `block`.
    fn make_descendant(&self, block: BlockInfo) -> Self {
        Self {
            block,
            authorities: self.effective_authorities(block.number),
            enabled: self.enabled_at(block.number),
            scheduled_after: None,
            forced_for: None,
            pause_after: None,
            resume_for: None,
            descendants: Vec::new(),
        }
    }

    /// The set in force at `number`, transitions applied in announcement
    /// order: a forced change wins over a scheduled one at the same node.
    fn effective_authorities(&self, number: BlockNumber) -> AuthorityList {
        if let Some((activate_at, list)) = &self.forced_for {
            if number >= *activate_at {
                return list.clone();
            }
        }
        if let Some((activate_at, list)) = &self.scheduled_after {
            if number >= *activate_at {
                return list.clone();
            }
        }
        self.authorities.clone()
    }

    fn enabled_at(&self, number: BlockNumber) -> bool {
        if let Some(resume_at) = self.resume_for {
            if number >= resume_at {
                return true;
            }
        }
        if let Some(pause_at) = self.pause_after {
            if number >= pause_at {
                return false;
            }
        }
        self.enabled
    }
}

impl ScaleEncode for ScheduleNode {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.block)
            .encode_field(&self.authorities)
            .encode_field(&self.enabled)
            .encode_field(&self.scheduled_after)
            .encode_field(&self.forced_for)
            .encode_field(&self.pause_after)
            .encode_field(&self.resume_for)
            .encode_field(&self.descendants)
            .finish();
    }
}

impl ScaleDecode for ScheduleNode {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (block, decoder) = decoder.decode_field("block")?;
        let (authorities, decoder) = decoder.decode_field("authorities")?;
        let (enabled, decoder) = decoder.decode_field("enabled")?;
        let (scheduled_after, decoder) = decoder.decode_field("scheduled_after")?;
        let (forced_for, decoder) = decoder.decode_field("forced_for")?;
        let (pause_after, decoder) = decoder.decode_field("pause_after")?;
        let (resume_for, decoder) = decoder.decode_field("resume_for")?;
        let (descendants, decoder) = decoder.decode_field("descendants")?;
        Ok((
            Self {
                block,
                authorities,
                enabled,
                scheduled_after,
                forced_for,
                pause_after,
                resume_for,
                descendants,
            },
            decoder.finish(),
        ))
    }
}

/// Tracks authority-set transitions across forks and answers which set is in
/// force for any known block.
///
/// Mutations are serialized behind the lock; `authorities` runs on a
/// consistent snapshot of the tree.
pub struct AuthorityManager {
    db: Arc<dyn KvStore>,
    root: RwLock<ScheduleNode>,
}

impl AuthorityManager {
    /// Recovers the persisted scheduler tree, or seeds one from the genesis
    /// set.
    pub fn load_or_init(
        db: Arc<dyn KvStore>,
        genesis: BlockInfo,
        genesis_authorities: AuthorityList,
    ) -> Result<Self, AuthorityError> {
        let root = match db.get(SCHEDULER_TREE_KEY)? {
            Some(raw) => ScheduleNode::decode(&raw)?,
            None => ScheduleNode::root(genesis, genesis_authorities),
        };
        Ok(Self {
            db,
            root: RwLock::new(root),
        })
    }

    /// The authority set that verifies `block`. Paused spans yield an empty
    /// list: the set emits no votes there.
    pub fn authorities(
        &self,
        block: &BlockInfo,
        ancestry: &dyn AncestryProvider,
    ) -> Result<AuthorityList, AuthorityError> {
        let root = self.root.read().map_err(|_| AuthorityError::LockError)?;
        let mut node: &ScheduleNode = &root;
        if node.block != *block && !ancestry.has_direct_chain(&node.block.hash, &block.hash) {
            return Err(AuthorityError::NoScheduleNode);
        }
        loop {
            let next = node.descendants.iter().find(|descendant| {
                descendant.block.number <= block.number
                    && (descendant.block == *block
                        || ancestry.has_direct_chain(&descendant.block.hash, &block.hash))
            });
            match next {
                Some(descendant) => node = descendant,
                None => break,
            }
        }
        if !node.enabled_at(block.number) {
            return Ok(AuthorityList::default());
        }
        Ok(node.effective_authorities(block.number))
    }

    pub fn apply_scheduled_change(
        &self,
        block: &BlockInfo,
        authorities: AuthorityList,
        activate_at: BlockNumber,
        ancestry: &dyn AncestryProvider,
    ) -> Result<(), AuthorityError> {
        debug!(block = %block.hash, activate_at, "scheduled authority change");
        self.with_ancestor(block, ancestry, |node| {
            node.scheduled_after = Some((activate_at, authorities));
        })
    }

    pub fn apply_forced_change(
        &self,
        block: &BlockInfo,
        authorities: AuthorityList,
        activate_at: BlockNumber,
        ancestry: &dyn AncestryProvider,
    ) -> Result<(), AuthorityError> {
        debug!(block = %block.hash, activate_at, "forced authority change");
        self.with_ancestor(block, ancestry, |node| {
            node.forced_for = Some((activate_at, authorities));
        })
    }

    /// Zeroes the weight of one authority from `block` onward; descendants
    /// created later inherit the disabled entry.
    pub fn apply_on_disabled(
        &self,
        block: &BlockInfo,
        authority_index: u64,
        ancestry: &dyn AncestryProvider,
    ) -> Result<(), AuthorityError> {
        let mut out_of_bounds = false;
        self.with_ancestor(block, ancestry, |node| {
            match node.authorities.0.get_mut(authority_index as usize) {
                Some(authority) => authority.weight = 0,
                None => out_of_bounds = true,
            }
        })?;
        if out_of_bounds {
            return Err(AuthorityError::BadAuthorityIndex(authority_index));
        }
        Ok(())
    }

    pub fn apply_pause(
        &self,
        block: &BlockInfo,
        activate_at: BlockNumber,
        ancestry: &dyn AncestryProvider,
    ) -> Result<(), AuthorityError> {
        self.with_ancestor(block, ancestry, |node| {
            node.pause_after = Some(activate_at);
        })
    }

    pub fn apply_resume(
        &self,
        block: &BlockInfo,
        activate_at: BlockNumber,
        ancestry: &dyn AncestryProvider,
    ) -> Result<(), AuthorityError> {
        self.with_ancestor(block, ancestry, |node| {
            node.resume_for = Some(activate_at);
        })
    }

    /// Dispatches a verification digest observed at `block`.
    pub fn on_verification(
        &self,
        block: &BlockInfo,
        digest: VerificationDigest,
        ancestry: &dyn AncestryProvider,
    ) -> Result<(), AuthorityError> {
        match digest {
            VerificationDigest::ScheduledChange { authorities, delay } => {
                self.apply_scheduled_change(block, authorities, block.number + delay, ancestry)
            }
            VerificationDigest::ForcedChange { authorities, delay } => {
                self.apply_forced_change(block, authorities, block.number + delay, ancestry)
            }
            VerificationDigest::OnDisabled { authority_index } => {
                self.apply_on_disabled(block, authority_index, ancestry)
            }
            VerificationDigest::Pause { delay } => {
                self.apply_pause(block, block.number + delay, ancestry)
            }
            VerificationDigest::Resume { delay } => {
                self.apply_resume(block, block.number + delay, ancestry)
            }
        }
    }

    /// Re-roots the tree at the deepest node at or below the finalized
    /// block, materializing due transitions, and persists the result.
    pub fn finalize(
        &self,
        block: &BlockInfo,
        ancestry: &dyn AncestryProvider,
    ) -> Result<(), AuthorityError> {
        let mut root = self.root.write().map_err(|_| AuthorityError::LockError)?;

        let mut new_root = root.clone();
        loop {
            let next = new_root.descendants.iter().position(|descendant| {
                descendant.block.number <= block.number
                    && (descendant.block == *block
                        || ancestry.has_direct_chain(&descendant.block.hash, &block.hash))
            });
            match next {
                Some(index) => new_root = new_root.descendants.swap_remove(index),
                None => break,
            }
        }
        // a change due at or before the finalized block becomes the set
        new_root.authorities = new_root.effective_authorities(block.number);
        new_root.enabled = new_root.enabled_at(block.number);
        if new_root
            .scheduled_after
            .as_ref()
            .is_some_and(|(at, _)| block.number >= *at)
        {
            new_root.scheduled_after = None;
        }
        if new_root
            .forced_for
            .as_ref()
            .is_some_and(|(at, _)| block.number >= *at)
        {
            new_root.forced_for = None;
        }
        // siblings of the finalized chain die with their forks
        new_root
            .descendants
            .retain(|descendant| {
                descendant.block == *block
                    || ancestry.has_direct_chain(&block.hash, &descendant.block.hash)
                    || ancestry.has_direct_chain(&descendant.block.hash, &block.hash)
            });
        info!(block = %block.hash, "authority scheduler re-rooted");
        *root = new_root;
        self.db
            .put(SCHEDULER_TREE_KEY, &root.encode_to_vec())?;
        Ok(())
    }

    fn with_ancestor<F>(
        &self,
        block: &BlockInfo,
        ancestry: &dyn AncestryProvider,
        apply: F,
    ) -> Result<(), AuthorityError>
    where
        F: FnOnce(&mut ScheduleNode),
    {
        let mut root = self.root.write().map_err(|_| AuthorityError::LockError)?;
        let node = appropriate_ancestor(&mut root, block, ancestry)
            .ok_or(AuthorityError::NoScheduleNode)?;
        if node.block == *block {
            apply(node);
        } else {
            let mut child = node.make_descendant(*block);
            apply(&mut child);
            node.descendants.push(child);
        }
        self.db
            .put(SCHEDULER_TREE_KEY, &root.encode_to_vec())?;
        Ok(())
    }
}

/// Deepest existing node whose block is `block` itself or one of its
/// ancestors.
fn appropriate_ancestor<'a>(
    node: &'a mut ScheduleNode,
    block: &BlockInfo,
    ancestry: &dyn AncestryProvider,
) -> Option<&'a mut ScheduleNode> {
    if node.block != *block && !ancestry.has_direct_chain(&node.block.hash, &block.hash) {
        return None;
    }
    if node.block == *block {
        return Some(node);
    }
    let next = node.descendants.iter_mut().position(|descendant| {
        descendant.block == *block
            || (descendant.block.number <= block.number
                && ancestry.has_direct_chain(&descendant.block.hash, &block.hash))
    });
    match next {
        Some(index) => appropriate_ancestor(&mut node.descendants[index], block, ancestry),
        None => Some(node),
    }
}

/// Finalization hook: a `BlockTree` observer that advances the scheduler.
pub struct AuthorityFinalizationObserver {
    manager: Arc<AuthorityManager>,
}

impl AuthorityFinalizationObserver {
    pub fn new(manager: Arc<AuthorityManager>) -> Self {
        Self { manager }
    }
}

impl FinalizationObserver for AuthorityFinalizationObserver {
    fn on_finalize(&self, block: &BlockInfo, ancestry: &dyn AncestryProvider) {
        if let Err(err) = self.manager.finalize(block, ancestry) {
            tracing::error!(%err, block = %block.hash, "authority scheduler finalization failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;
    use std::collections::HashMap;
    use taskmesh_common::{Authority, AuthorityId};
    use taskmesh_storage::InMemoryKvStore;

    /// parent map standing in for the block tree
    struct Chain(HashMap<H256, H256>);

    impl AncestryProvider for Chain {
        fn has_direct_chain(&self, ancestor: &H256, descendant: &H256) -> bool {
            let mut current = *descendant;
            while current != *ancestor {
                match self.0.get(&current) {
                    Some(parent) => current = *parent,
                    None => return false,
                }
            }
            true
        }
    }

    fn block(number: u64, tag: u8) -> BlockInfo {
        BlockInfo::new(number, H256::repeat_byte(tag))
    }

    fn list(weights: &[(u8, u64)]) -> AuthorityList {
        weights
            .iter()
            .map(|(tag, weight)| Authority {
                id: AuthorityId([*tag; 32]),
                weight: *weight,
            })
            .collect()
    }

    fn linear_chain(blocks: &[BlockInfo]) -> Chain {
        let mut parents = HashMap::new();
        for pair in blocks.windows(2) {
            parents.insert(pair[1].hash, pair[0].hash);
        }
        Chain(parents)
    }

    fn manager(genesis: BlockInfo, authorities: AuthorityList) -> AuthorityManager {
        AuthorityManager::load_or_init(Arc::new(InMemoryKvStore::new()), genesis, authorities)
            .expect("manager")
    }

    #[test]
    fn scheduled_change_activates_at_delay() {
        let blocks = [block(0, 0), block(1, 1), block(2, 2), block(3, 3), block(4, 4)];
        let chain = linear_chain(&blocks);
        let manager = manager(blocks[0], list(&[(0xaa, 1)]));

        manager
            .apply_scheduled_change(&blocks[1], list(&[(0xbb, 1)]), 3, &chain)
            .expect("apply");

        assert_eq!(
            manager.authorities(&blocks[2], &chain).expect("query"),
            list(&[(0xaa, 1)])
        );
        assert_eq!(
            manager.authorities(&blocks[3], &chain).expect("query"),
            list(&[(0xbb, 1)])
        );
        assert_eq!(
            manager.authorities(&blocks[4], &chain).expect("query"),
            list(&[(0xbb, 1)])
        );
    }

    #[test]
    fn on_disabled_zeroes_weight_from_block_onward() {
        let blocks = [block(0, 0), block(1, 1), block(2, 2)];
        let chain = linear_chain(&blocks);
        let manager = manager(blocks[0], list(&[(0xaa, 1), (0xbb, 2)]));

        manager
            .apply_on_disabled(&blocks[1], 1, &chain)
            .expect("apply");

        assert_eq!(
            manager.authorities(&blocks[0], &chain).expect("query"),
            list(&[(0xaa, 1), (0xbb, 2)])
        );
        assert_eq!(
            manager.authorities(&blocks[2], &chain).expect("query"),
            list(&[(0xaa, 1), (0xbb, 0)])
        );
        assert!(matches!(
            manager.apply_on_disabled(&blocks[1], 9, &chain),
            Err(AuthorityError::BadAuthorityIndex(9))
        ));
    }

    #[test]
    fn pause_and_resume() {
        let blocks = [block(0, 0), block(1, 1), block(2, 2), block(3, 3), block(4, 4)];
        let chain = linear_chain(&blocks);
        let manager = manager(blocks[0], list(&[(0xaa, 1)]));

        manager.apply_pause(&blocks[1], 2, &chain).expect("apply");
        assert_eq!(
            manager.authorities(&blocks[1], &chain).expect("query"),
            list(&[(0xaa, 1)])
        );
        assert!(manager
            .authorities(&blocks[2], &chain)
            .expect("query")
            .is_empty());

        manager.apply_resume(&blocks[3], 4, &chain).expect("apply");
        assert!(manager
            .authorities(&blocks[3], &chain)
            .expect("query")
            .is_empty());
        assert_eq!(
            manager.authorities(&blocks[4], &chain).expect("query"),
            list(&[(0xaa, 1)])
        );
    }

    #[test]
    fn digests_on_descendants_do_not_move_finalized_snapshots() {
        let blocks = [block(0, 0), block(1, 1), block(2, 2), block(3, 3)];
        let chain = linear_chain(&blocks);
        let manager = manager(blocks[0], list(&[(0xaa, 1)]));

        let before = manager.authorities(&blocks[1], &chain).expect("query");
        manager
            .apply_scheduled_change(&blocks[2], list(&[(0xbb, 1)]), 3, &chain)
            .expect("apply");
        let after = manager.authorities(&blocks[1], &chain).expect("query");
        assert_eq!(before, after);
    }

    #[test]
    fn finalize_reroots_and_survives_restart() {
        let blocks = [block(0, 0), block(1, 1), block(2, 2), block(3, 3)];
        let chain = linear_chain(&blocks);
        let db = Arc::new(InMemoryKvStore::new());
        let manager =
            AuthorityManager::load_or_init(db.clone(), blocks[0], list(&[(0xaa, 1)]))
                .expect("manager");
        manager
            .apply_scheduled_change(&blocks[1], list(&[(0xbb, 1)]), 2, &chain)
            .expect("apply");
        manager.finalize(&blocks[2], &chain).expect("finalize");

        assert_eq!(
            manager.authorities(&blocks[3], &chain).expect("query"),
            list(&[(0xbb, 1)])
        );

        // the persisted subtree is enough to answer after a restart
        let recovered =
            AuthorityManager::load_or_init(db, blocks[0], list(&[(0xcc, 1)])).expect("manager");
        assert_eq!(
            recovered.authorities(&blocks[3], &chain).expect("query"),
            list(&[(0xbb, 1)])
        );
    }

    #[test]
    fn fork_changes_stay_on_their_branch() {
        // 0 -> 1 -> 2a
        //        \-> 2b
        let root = block(0, 0);
        let mid = block(1, 1);
        let fork_a = block(2, 0xa0);
        let fork_b = block(2, 0xb0);
        let mut parents = HashMap::new();
        parents.insert(mid.hash, root.hash);
        parents.insert(fork_a.hash, mid.hash);
        parents.insert(fork_b.hash, mid.hash);
        let chain = Chain(parents);

        let manager = manager(root, list(&[(0xaa, 1)]));
        manager
            .apply_scheduled_change(&fork_a, list(&[(0xbb, 1)]), 2, &chain)
            .expect("apply");

        assert_eq!(
            manager.authorities(&fork_a, &chain).expect("query"),
            list(&[(0xbb, 1)])
        );
        assert_eq!(
            manager.authorities(&fork_b, &chain).expect("query"),
            list(&[(0xaa, 1)])
        );
    }
}
