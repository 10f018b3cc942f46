use bytes::Bytes;
use ethereum_types::H256;
use std::sync::{Arc, RwLock};
use taskmesh_common::{BlockInfo, Justification};
use taskmesh_scale::ScaleEncode;
use taskmesh_storage::BlockHeaderRepository;
use tracing::info;

use crate::error::{ChainError, FinalityError};
use crate::finality::types::{FinalityJustification, SignedVote};
use crate::gossip::{GossipMessage, Gossiper, MessageKind};
use crate::tree::BlockTree;

/// The voting rounds' window onto the chain: best-chain selection, ancestry
/// and the finalization side effects, plus the outbound vote wire.
pub struct Environment {
    tree: Arc<RwLock<BlockTree>>,
    headers: Arc<BlockHeaderRepository>,
    gossiper: Arc<dyn Gossiper>,
}

impl Environment {
    pub fn new(
        tree: Arc<RwLock<BlockTree>>,
        headers: Arc<BlockHeaderRepository>,
        gossiper: Arc<dyn Gossiper>,
    ) -> Self {
        Self {
            tree,
            headers,
            gossiper,
        }
    }

    pub fn headers(&self) -> &Arc<BlockHeaderRepository> {
        &self.headers
    }

    pub fn last_finalized(&self) -> Result<BlockInfo, FinalityError> {
        let tree = self.tree.read().map_err(|_| ChainError::LockError)?;
        Ok(tree.get_last_finalized())
    }

    /// Deepest block on the best chain containing `base`.
    pub fn best_chain_containing(&self, base: &H256) -> Result<BlockInfo, FinalityError> {
        let tree = self.tree.read().map_err(|_| ChainError::LockError)?;
        tree.get_best_containing(base, None)
            .map_err(FinalityError::from)
    }

    /// Chain from `base` down to `block`, top-to-bottom.
    pub fn ancestry(&self, base: &H256, block: &H256) -> Result<Vec<H256>, FinalityError> {
        let tree = self.tree.read().map_err(|_| ChainError::LockError)?;
        tree.get_chain_by_blocks(base, block)
            .map_err(FinalityError::from)
    }

    pub fn is_descendant(&self, ancestor: &H256, descendant: &H256) -> bool {
        self.tree
            .read()
            .map(|tree| tree.has_direct_chain(ancestor, descendant))
            .unwrap_or(false)
    }

    /// Applies a finality proof to the tree and announces it.
    pub fn finalize(&self, justification: &FinalityJustification) -> Result<(), FinalityError> {
        let encoded = Justification(Bytes::from(justification.encode_to_vec()));
        {
            let mut tree = self.tree.write().map_err(|_| ChainError::LockError)?;
            tree.finalize(&justification.block.hash, &encoded)?;
        }
        info!(round = justification.round, block = %justification.block.hash, "round finalized");
        self.gossiper.broadcast(GossipMessage {
            kind: MessageKind::Verification,
            data: Bytes::from(justification.encode_to_vec()),
        });
        Ok(())
    }

    /// Puts one of our own votes on the wire, deduplicated per stage.
    pub fn broadcast_vote(&self, signed: &SignedVote) {
        self.gossiper.broadcast_vote(
            signed.round,
            signed.id,
            signed.vote.stage.as_u8(),
            GossipMessage {
                kind: MessageKind::Verification,
                data: Bytes::from(signed.encode_to_vec()),
            },
        );
    }
}
