use bytes::Bytes;
use ethereum_types::H256;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use taskmesh_common::{
    AuthorityId, AuthorityList, Block, BlockHeader, DigestItem, EngineId, Extrinsic, Hasher,
};
use taskmesh_scale::ScaleEncode;
use taskmesh_trie::ordered_trie_root;
use tracing::{debug, info, warn};

use crate::error::ProductionError;
use crate::gossip::{GossipMessage, Gossiper, MessageKind};
use crate::mempool::TransactionPool;
use crate::tree::BlockTree;

/// Sync progress of the authoring node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionState {
    /// Just started; waiting for a first block announce to learn the tip.
    WaitBlock,
    /// Fetching the blocks between the announced tip and our chain.
    CatchingUp,
    /// Blocks applied; the slot clock still needs calibrating.
    NeedSlotTime,
    /// Fully synced; eligible to author.
    Synchronized,
}

/// Asks peers for the blocks we are missing.
pub trait SyncRequester: Send + Sync {
    fn request_blocks(&self, from: H256, to: H256);
}

#[derive(Debug, Clone)]
pub struct ProductionConfig {
    pub slot_duration: Duration,
    pub epoch_length: u64,
    /// Lottery acceptance ratio in parts per million per weight unit.
    pub threshold_ppm: u32,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            slot_duration: Duration::from_secs(6),
            epoch_length: 600,
            threshold_ppm: 250_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Epoch {
    pub index: u64,
    pub start_slot: u64,
    pub randomness: [u8; 32],
    pub authorities: AuthorityList,
}

impl Epoch {
    /// Deterministic randomness rollover between epochs.
    pub fn next(&self) -> Epoch {
        let mut seed = self.randomness.to_vec();
        (self.index + 1).encode(&mut seed);
        Epoch {
            index: self.index + 1,
            start_slot: self.start_slot + 1,
            randomness: Hasher::blake2b_256(&seed).0,
            authorities: self.authorities.clone(),
        }
    }
}

/// Slot lottery: an authority leads a slot when its draw lands under the
/// threshold scaled by its weight. The draw is deterministic, so every node
/// agrees on who was eligible.
pub fn slot_leadership(
    epoch: &Epoch,
    slot: u64,
    authority: &AuthorityId,
    threshold_ppm: u32,
) -> bool {
    let Some(weight) = epoch
        .authorities
        .iter()
        .find(|candidate| candidate.id == *authority)
        .map(|candidate| candidate.weight)
    else {
        return false;
    };
    if weight == 0 {
        return false;
    }
    let mut seed = epoch.randomness.to_vec();
    slot.encode(&mut seed);
    authority.encode(&mut seed);
    let draw = Hasher::blake2b_256(&seed);
    let sample = u64::from_le_bytes(
        draw.0[..8]
            .try_into()
            .unwrap_or_default(),
    ) % 1_000_000;
    sample < u64::from(threshold_ppm).saturating_mul(weight).min(1_000_000)
}

/// Authoring loop: tracks sync state, runs the per-slot lottery and builds
/// blocks from the pool on won slots.
pub struct Production {
    config: ProductionConfig,
    state: ProductionState,
    epoch: Epoch,
    current_slot: u64,
    authority: Option<AuthorityId>,
    tree: Arc<RwLock<BlockTree>>,
    pool: Arc<TransactionPool>,
    gossiper: Arc<dyn Gossiper>,
    sync: Arc<dyn SyncRequester>,
}

impl Production {
    pub fn new(
        config: ProductionConfig,
        genesis_epoch: Epoch,
        authority: Option<AuthorityId>,
        tree: Arc<RwLock<BlockTree>>,
        pool: Arc<TransactionPool>,
        gossiper: Arc<dyn Gossiper>,
        sync: Arc<dyn SyncRequester>,
    ) -> Self {
        let current_slot = genesis_epoch.start_slot;
        Self {
            config,
            state: ProductionState::WaitBlock,
            epoch: genesis_epoch,
            current_slot,
            authority,
            tree,
            pool,
            gossiper,
            sync,
        }
    }

    pub fn state(&self) -> ProductionState {
        self.state
    }

    pub fn current_epoch(&self) -> &Epoch {
        &self.epoch
    }

    pub fn current_slot(&self) -> u64 {
        self.current_slot
    }

    /// Handles a block announce from the network, driving the sync state
    /// machine; a missing parent keeps us catching up and re-requests the
    /// gap.
    pub fn on_block_announce(&mut self, header: &BlockHeader) -> Result<(), ProductionError> {
        let added = {
            let mut tree = self.tree.write().map_err(|_| {
                ProductionError::Chain(crate::error::ChainError::LockError)
            })?;
            tree.add_block_header(header)
        };
        match self.state {
            ProductionState::WaitBlock => {
                info!(number = header.number, "first announce, catching up");
                self.state = ProductionState::CatchingUp;
                self.request_gap(header);
            }
            ProductionState::CatchingUp => {}
            ProductionState::NeedSlotTime | ProductionState::Synchronized => {}
        }
        match added {
            Ok(_) => {
                if self.state == ProductionState::CatchingUp {
                    // tip applied cleanly: the gap is closed
                    self.state = ProductionState::NeedSlotTime;
                    self.calibrate_slot(header);
                }
                Ok(())
            }
            Err(crate::error::ChainError::ParentNotFound) => {
                self.state = ProductionState::CatchingUp;
                self.request_gap(header);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn request_gap(&self, header: &BlockHeader) {
        let from = self
            .tree
            .read()
            .map(|tree| tree.get_last_finalized().hash)
            .unwrap_or_default();
        self.sync.request_blocks(from, header.hash());
    }

    // Slot time comes from the announced tip; with one estimate we are
    // calibrated enough to author.
    fn calibrate_slot(&mut self, header: &BlockHeader) {
        self.current_slot = self.epoch.start_slot + header.number;
        self.state = ProductionState::Synchronized;
        debug!(slot = self.current_slot, "slot clock calibrated");
    }

    /// Runs one slot: advances the clock, rolls the epoch over when
    /// exhausted, and authors a block if the lottery is won.
    pub fn process_slot(&mut self) -> Result<Option<Block>, ProductionError> {
        if self.state != ProductionState::Synchronized {
            return Err(ProductionError::NotSynchronized);
        }
        let slot = self.current_slot;
        self.current_slot += 1;
        if slot >= self.epoch.start_slot + self.config.epoch_length {
            let next = self.epoch.next();
            info!(epoch = next.index, "epoch rollover");
            self.epoch = Epoch {
                start_slot: slot,
                ..next
            };
        }
        let Some(authority) = self.authority else {
            return Ok(None);
        };
        if !slot_leadership(&self.epoch, slot, &authority, self.config.threshold_ppm) {
            return Ok(None);
        }
        let block = self.build_block(slot)?;
        Ok(Some(block))
    }

    fn build_block(&self, slot: u64) -> Result<Block, ProductionError> {
        let ready = self.pool.get_ready_transactions();
        let extrinsics: Vec<Extrinsic> = ready.iter().map(|tx| tx.ext.clone()).collect();
        let extrinsics_root =
            ordered_trie_root(extrinsics.iter().map(|ext| ext.encode_to_vec()));

        let mut tree = self
            .tree
            .write()
            .map_err(|_| ProductionError::Chain(crate::error::ChainError::LockError))?;
        let parent = tree.deepest_leaf();
        let parent_header = tree.get_block_header(&parent.hash.into())?;

        let header = BlockHeader {
            parent_hash: parent.hash,
            number: parent.number + 1,
            // state transitions are applied by the executor when the block
            // is imported; the proposer reuses the parent state root
            state_root: parent_header.state_root,
            extrinsics_root,
            digest: vec![DigestItem::PreRuntime(
                EngineId::PRODUCTION,
                Bytes::from(slot.encode_to_vec()),
            )],
        };
        let block = Block {
            header,
            body: extrinsics,
        };
        let hash = tree.add_block(&block)?;
        drop(tree);

        for tx in &ready {
            if let Err(err) = self.pool.remove_one(&tx.hash) {
                warn!(tx = %tx.hash, %err, "could not drop included transaction");
            }
        }
        info!(slot, block = %hash, extrinsics = block.body.len(), "authored block");
        self.gossiper.broadcast(GossipMessage {
            kind: MessageKind::BlockAnnounce,
            data: Bytes::from(block.header.encode_to_vec()),
        });
        Ok(block)
    }

    /// Timer-driven authoring loop; one `process_slot` per slot duration.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.slot_duration);
        loop {
            ticker.tick().await;
            match self.process_slot() {
                Ok(Some(block)) => {
                    debug!(number = block.header.number, "slot produced a block")
                }
                Ok(None) => {}
                Err(ProductionError::NotSynchronized) => {
                    debug!("skipping slot while syncing")
                }
                Err(err) => warn!(%err, "slot processing failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::BroadcastGossiper;
    use crate::mempool::{PoolLimits, PoolModerator, PoolTransaction, StructuralValidator};
    use std::sync::Mutex;
    use taskmesh_common::Authority;
    use taskmesh_storage::{BlockHeaderRepository, BlockStorage, InMemoryKvStore};
    use taskmesh_trie::EMPTY_TRIE_ROOT;

    struct NoSync(Mutex<Vec<(H256, H256)>>);

    impl SyncRequester for NoSync {
        fn request_blocks(&self, from: H256, to: H256) {
            self.0.lock().expect("lock").push((from, to));
        }
    }

    fn authority() -> AuthorityId {
        AuthorityId([7; 32])
    }

    fn epoch() -> Epoch {
        Epoch {
            index: 0,
            start_slot: 0,
            randomness: [5; 32],
            authorities: AuthorityList(vec![Authority {
                id: authority(),
                weight: 1,
            }]),
        }
    }

    struct Fixture {
        production: Production,
        pool: Arc<TransactionPool>,
        tree: Arc<RwLock<BlockTree>>,
        sync: Arc<NoSync>,
        gossiper: Arc<BroadcastGossiper>,
    }

    fn fixture(threshold_ppm: u32) -> Fixture {
        let db = Arc::new(InMemoryKvStore::new());
        let headers = Arc::new(BlockHeaderRepository::new(db.clone()));
        let storage = Arc::new(
            BlockStorage::create_with_genesis(
                H256::repeat_byte(1),
                &epoch().authorities,
                db,
                headers.clone(),
            )
            .expect("genesis creation"),
        );
        let tree = Arc::new(RwLock::new(BlockTree::new(storage).expect("tree")));
        let pool = Arc::new(TransactionPool::new(
            Arc::new(PoolModerator::default()),
            Box::new(StructuralValidator),
            headers,
            PoolLimits::default(),
        ));
        let sync = Arc::new(NoSync(Mutex::new(Vec::new())));
        let gossiper = Arc::new(BroadcastGossiper::default());
        let production = Production::new(
            ProductionConfig {
                slot_duration: Duration::from_millis(5),
                epoch_length: 4,
                threshold_ppm,
            },
            epoch(),
            Some(authority()),
            tree.clone(),
            pool.clone(),
            gossiper.clone(),
            sync.clone(),
        );
        Fixture {
            production,
            pool,
            tree,
            sync,
            gossiper,
        }
    }

    fn tip_header(tree: &Arc<RwLock<BlockTree>>) -> BlockHeader {
        let tree = tree.read().expect("lock");
        let tip = tree.deepest_leaf();
        tree.get_block_header(&tip.hash.into()).expect("header")
    }

    #[test]
    fn lottery_is_deterministic_and_weight_sensitive() {
        let epoch = epoch();
        let won: Vec<u64> = (0..256)
            .filter(|slot| slot_leadership(&epoch, *slot, &authority(), 1_000_000))
            .collect();
        assert_eq!(won.len(), 256);
        let sometimes: Vec<u64> = (0..256)
            .filter(|slot| slot_leadership(&epoch, *slot, &authority(), 250_000))
            .collect();
        assert!(!sometimes.is_empty() && sometimes.len() < 256);
        // the same inputs always draw the same result
        let replay: Vec<u64> = (0..256)
            .filter(|slot| slot_leadership(&epoch, *slot, &authority(), 250_000))
            .collect();
        assert_eq!(sometimes, replay);
        // an outsider never wins
        assert!(!(0..256).any(|slot| slot_leadership(&epoch, slot, &AuthorityId([1; 32]), 1_000_000)));
    }

    #[test]
    fn announce_walks_the_state_machine() {
        let mut fixture = fixture(1_000_000);
        assert_eq!(fixture.production.state(), ProductionState::WaitBlock);

        let tip = tip_header(&fixture.tree);
        let next = BlockHeader {
            parent_hash: tip.hash(),
            number: tip.number + 1,
            state_root: tip.state_root,
            extrinsics_root: *EMPTY_TRIE_ROOT,
            digest: vec![],
        };
        fixture.production.on_block_announce(&next).expect("announce");
        assert_eq!(fixture.production.state(), ProductionState::Synchronized);
        assert_eq!(fixture.sync.0.lock().expect("lock").len(), 1);
    }

    #[test]
    fn orphan_announce_keeps_catching_up() {
        let mut fixture = fixture(1_000_000);
        let orphan = BlockHeader {
            parent_hash: H256::repeat_byte(0x66),
            number: 9,
            state_root: H256::zero(),
            extrinsics_root: *EMPTY_TRIE_ROOT,
            digest: vec![],
        };
        fixture.production.on_block_announce(&orphan).expect("announce");
        assert_eq!(fixture.production.state(), ProductionState::CatchingUp);
        // both the initial announce and the orphan triggered requests
        assert_eq!(fixture.sync.0.lock().expect("lock").len(), 2);
    }

    #[test]
    fn won_slot_builds_a_block_from_the_pool() {
        let mut fixture = fixture(1_000_000);
        let tip = tip_header(&fixture.tree);
        let next = BlockHeader {
            parent_hash: tip.hash(),
            number: tip.number + 1,
            state_root: tip.state_root,
            extrinsics_root: *EMPTY_TRIE_ROOT,
            digest: vec![],
        };
        fixture.production.on_block_announce(&next).expect("announce");

        let ext = Extrinsic::new(vec![9, 9, 9]);
        fixture
            .pool
            .submit_one(PoolTransaction {
                hash: ext.hash(),
                bytes: 3,
                ext: ext.clone(),
                priority: 1,
                valid_till: u64::MAX,
                requires: vec![],
                provides: vec![b"t".to_vec()],
                should_propagate: true,
            })
            .expect("submit");

        fixture.gossiper.add_peer("peer");
        let block = fixture
            .production
            .process_slot()
            .expect("slot")
            .expect("block authored");
        assert_eq!(block.body, vec![ext]);
        assert_eq!(
            block.header.extrinsics_root,
            ordered_trie_root(block.body.iter().map(|e| e.encode_to_vec()))
        );
        // included transactions leave the pool, the announce hits the wire
        assert_eq!(fixture.pool.get_ready_transactions().len(), 0);
        assert_eq!(fixture.gossiper.drain_peer("peer").len(), 1);
        // and the tree adopted the new block
        assert_eq!(
            fixture.tree.read().expect("lock").deepest_leaf().hash,
            block.header.hash()
        );
    }

    #[test]
    fn unsynchronized_node_refuses_to_author() {
        let mut fixture = fixture(1_000_000);
        assert!(matches!(
            fixture.production.process_slot(),
            Err(ProductionError::NotSynchronized)
        ));
    }

    #[test]
    fn epoch_rolls_over_after_its_length() {
        let mut fixture = fixture(0);
        let tip = tip_header(&fixture.tree);
        let next = BlockHeader {
            parent_hash: tip.hash(),
            number: tip.number + 1,
            state_root: tip.state_root,
            extrinsics_root: *EMPTY_TRIE_ROOT,
            digest: vec![],
        };
        fixture.production.on_block_announce(&next).expect("announce");

        let first_epoch = fixture.production.current_epoch().index;
        for _ in 0..6 {
            fixture.production.process_slot().expect("slot");
        }
        assert_eq!(fixture.production.current_epoch().index, first_epoch + 1);
        assert_ne!(
            fixture.production.current_epoch().randomness,
            epoch().randomness
        );
    }
}
