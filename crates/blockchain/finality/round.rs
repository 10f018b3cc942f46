use secp256k1::SecretKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskmesh_common::{AuthorityId, BlockInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::FinalityError;
use crate::finality::environment::Environment;
use crate::finality::types::{
    FinalityJustification, RoundNumber, SignedVote, Vote, VoteStage, VoterSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Collecting prevotes.
    Prevoting,
    /// Prevote supermajority reached; collecting precommits on the ghost.
    Precommitting,
    /// A block was finalized or the round timed out.
    Completed,
}

/// One finality voting round over a fixed voter set.
///
/// Votes arrive in any order; the round advances when accumulated weight
/// crosses the 2/3 threshold at each stage.
pub struct VotingRound {
    round: RoundNumber,
    voters: VoterSet,
    env: Arc<Environment>,
    prevotes: HashMap<AuthorityId, SignedVote>,
    precommits: HashMap<AuthorityId, SignedVote>,
    ghost: Option<BlockInfo>,
    finalized: Option<BlockInfo>,
    state: RoundState,
}

impl VotingRound {
    pub fn new(round: RoundNumber, voters: VoterSet, env: Arc<Environment>) -> Self {
        Self {
            round,
            voters,
            env,
            prevotes: HashMap::new(),
            precommits: HashMap::new(),
            ghost: None,
            finalized: None,
            state: RoundState::Prevoting,
        }
    }

    pub fn round_number(&self) -> RoundNumber {
        self.round
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn finalized(&self) -> Option<BlockInfo> {
        self.finalized
    }

    pub fn prevote_ghost(&self) -> Option<BlockInfo> {
        self.ghost
    }

    /// The round's primary proposer, rotating through the set.
    pub fn primary(&self) -> Option<AuthorityId> {
        if self.voters.authorities.is_empty() {
            return None;
        }
        let index = (self.round as usize) % self.voters.authorities.len();
        Some(self.voters.authorities[index].id)
    }

    /// Prevote for the best descendant of the last finalized block.
    pub fn cast_prevote(&mut self, secret: &SecretKey) -> Result<SignedVote, FinalityError> {
        let base = self.env.last_finalized()?;
        let target = self.env.best_chain_containing(&base.hash)?;
        let signed = SignedVote::sign(
            secret,
            Vote {
                stage: VoteStage::Prevote,
                target,
            },
            self.round,
            self.voters.set_id,
        );
        self.env.broadcast_vote(&signed);
        self.on_signed_vote(signed.clone())?;
        Ok(signed)
    }

    /// Precommit to the current prevote-ghost; valid only once the prevote
    /// stage produced one.
    pub fn cast_precommit(&mut self, secret: &SecretKey) -> Result<SignedVote, FinalityError> {
        let ghost = self.ghost.ok_or(FinalityError::UnknownBlock)?;
        let signed = SignedVote::sign(
            secret,
            Vote {
                stage: VoteStage::Precommit,
                target: ghost,
            },
            self.round,
            self.voters.set_id,
        );
        self.env.broadcast_vote(&signed);
        self.on_signed_vote(signed.clone())?;
        Ok(signed)
    }

    /// Feeds one vote into the round. Returns the newly finalized block
    /// when this vote completes the precommit supermajority.
    pub fn on_signed_vote(
        &mut self,
        signed: SignedVote,
    ) -> Result<Option<BlockInfo>, FinalityError> {
        if self.state == RoundState::Completed {
            return Err(FinalityError::RoundCompleted(self.round));
        }
        if signed.round != self.round || signed.set_id != self.voters.set_id {
            return Err(FinalityError::UnknownBlock);
        }
        signed.verify()?;
        if !self.voters.contains(&signed.id) {
            return Err(FinalityError::UnknownVoter);
        }
        let book = match signed.vote.stage {
            VoteStage::Prevote => &mut self.prevotes,
            VoteStage::Precommit => &mut self.precommits,
        };
        if book.contains_key(&signed.id) {
            return Err(FinalityError::DuplicateVote);
        }
        book.insert(signed.id, signed);

        self.evaluate()
    }

    fn evaluate(&mut self) -> Result<Option<BlockInfo>, FinalityError> {
        if self.state == RoundState::Prevoting {
            let prevote_weight = self.weight_of(&self.prevotes);
            if self.voters.is_supermajority(prevote_weight) {
                self.ghost = self.compute_prevote_ghost()?;
                if let Some(ghost) = self.ghost {
                    debug!(round = self.round, ghost = %ghost.hash, "prevote ghost fixed");
                    self.state = RoundState::Precommitting;
                }
            }
        }
        if self.state == RoundState::Precommitting {
            if let Some(ghost) = self.ghost {
                let weight: u64 = self
                    .precommits
                    .values()
                    .filter(|vote| vote.vote.target.hash == ghost.hash)
                    .filter_map(|vote| self.voters.weight_of(&vote.id))
                    .sum();
                if self.voters.is_supermajority(weight) {
                    return self.finalize(ghost).map(Some);
                }
            }
        }
        Ok(None)
    }

    fn finalize(&mut self, block: BlockInfo) -> Result<BlockInfo, FinalityError> {
        let justification = FinalityJustification {
            round: self.round,
            block,
            precommits: self
                .precommits
                .values()
                .filter(|vote| vote.vote.target.hash == block.hash)
                .cloned()
                .collect(),
        };
        self.env.finalize(&justification)?;
        self.finalized = Some(block);
        self.state = RoundState::Completed;
        Ok(block)
    }

    /// The highest block whose chain carries a prevote supermajority.
    ///
    /// Every prevote counts for its target and all of the target's
    /// ancestors back to the last finalized block.
    fn compute_prevote_ghost(&self) -> Result<Option<BlockInfo>, FinalityError> {
        let base = self.env.last_finalized()?;
        let mut weights: HashMap<ethereum_types::H256, (u64, u64)> = HashMap::new();
        for vote in self.prevotes.values() {
            let Some(weight) = self.voters.weight_of(&vote.id) else {
                continue;
            };
            let Ok(chain) = self.env.ancestry(&base.hash, &vote.vote.target.hash) else {
                // vote for an unknown fork contributes nothing
                continue;
            };
            for (depth, hash) in chain.into_iter().enumerate() {
                let number = base.number + depth as u64;
                let entry = weights.entry(hash).or_insert((number, 0));
                entry.1 += weight;
            }
        }
        let mut best: Option<BlockInfo> = None;
        for (hash, (number, weight)) in weights {
            if !self.voters.is_supermajority(weight) {
                continue;
            }
            let candidate = BlockInfo::new(number, hash);
            let better = match best {
                None => true,
                Some(chosen) => {
                    candidate.number > chosen.number
                        || (candidate.number == chosen.number && candidate.hash < chosen.hash)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        Ok(best)
    }

    /// Ends the round with whatever was finalized; used on round timeout.
    pub fn complete(&mut self) {
        if self.state != RoundState::Completed {
            debug!(round = self.round, "round completed without finalization");
            self.state = RoundState::Completed;
        }
    }

    fn weight_of(&self, votes: &HashMap<AuthorityId, SignedVote>) -> u64 {
        votes
            .keys()
            .filter_map(|id| self.voters.weight_of(id))
            .sum()
    }
}

/// Drives voting rounds over a vote intake channel.
pub struct Finality {
    env: Arc<Environment>,
    round_timeout: Duration,
    local_key: Option<SecretKey>,
}

impl Finality {
    pub fn new(env: Arc<Environment>, round_timeout: Duration, local_key: Option<SecretKey>) -> Self {
        Self {
            env,
            round_timeout,
            local_key,
        }
    }

    /// Runs one round to completion: casts our votes if we hold a key,
    /// applies incoming votes, and cancels the round after the timeout.
    pub async fn run_round(
        &self,
        round_number: RoundNumber,
        voters: VoterSet,
        votes: &mut mpsc::Receiver<SignedVote>,
    ) -> VotingRound {
        let mut round = VotingRound::new(round_number, voters, self.env.clone());
        if let Some(secret) = &self.local_key {
            if let Err(err) = round.cast_prevote(secret) {
                warn!(round = round_number, %err, "could not cast prevote");
            }
        }
        let deadline = tokio::time::Instant::now() + self.round_timeout;
        while round.state() != RoundState::Completed {
            let vote = tokio::time::timeout_at(deadline, votes.recv()).await;
            match vote {
                Ok(Some(signed)) => {
                    match round.on_signed_vote(signed) {
                        Ok(Some(finalized)) => {
                            info!(round = round_number, block = %finalized.hash, "finalized in round");
                        }
                        Ok(None) => {}
                        Err(err) => debug!(round = round_number, %err, "vote rejected"),
                    }
                    // our precommit follows as soon as the ghost is known
                    if round.state() == RoundState::Precommitting {
                        if let Some(secret) = &self.local_key {
                            let already_cast = round
                                .precommits
                                .contains_key(&crate::finality::types::authority_id_of(
                                    &secret.public_key(secp256k1::SECP256K1),
                                ));
                            if !already_cast {
                                if let Err(err) = round.cast_precommit(secret) {
                                    warn!(round = round_number, %err, "could not cast precommit");
                                }
                            }
                        }
                    }
                }
                Ok(None) | Err(_) => {
                    round.complete();
                }
            }
        }
        round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finality::types::authority_id_of;
    use crate::gossip::BroadcastGossiper;
    use crate::tree::BlockTree;
    use ethereum_types::H256;
    use secp256k1::SECP256K1;
    use std::sync::RwLock;
    use taskmesh_common::{Authority, AuthorityList, BlockHeader, BlockId};
    use taskmesh_storage::{BlockHeaderRepository, BlockStorage, InMemoryKvStore};
    use taskmesh_trie::EMPTY_TRIE_ROOT;

    fn secret(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).expect("valid key")
    }

    fn header(parent: H256, number: u64, salt: u8) -> BlockHeader {
        BlockHeader {
            parent_hash: parent,
            number,
            state_root: H256::repeat_byte(salt),
            extrinsics_root: *EMPTY_TRIE_ROOT,
            digest: vec![],
        }
    }

    struct Fixture {
        env: Arc<Environment>,
        tree: Arc<RwLock<BlockTree>>,
        voters: VoterSet,
        secrets: Vec<SecretKey>,
        storage: Arc<BlockStorage>,
    }

    fn fixture() -> Fixture {
        let secrets = vec![secret(1), secret(2), secret(3)];
        let authorities: AuthorityList = secrets
            .iter()
            .map(|secret| Authority {
                id: authority_id_of(&secret.public_key(SECP256K1)),
                weight: 1,
            })
            .collect();

        let db = Arc::new(InMemoryKvStore::new());
        let headers = Arc::new(BlockHeaderRepository::new(db.clone()));
        let storage = Arc::new(
            BlockStorage::create_with_genesis(H256::repeat_byte(1), &authorities, db, headers.clone())
                .expect("genesis creation"),
        );
        let tree = Arc::new(RwLock::new(BlockTree::new(storage.clone()).expect("tree")));
        let env = Arc::new(Environment::new(
            tree.clone(),
            headers,
            Arc::new(BroadcastGossiper::default()),
        ));
        Fixture {
            env,
            tree,
            voters: VoterSet::new(1, authorities),
            secrets,
            storage,
        }
    }

    fn extend_chain(fixture: &Fixture, length: u64) -> Vec<H256> {
        let mut tree = fixture.tree.write().expect("lock");
        let mut parent = tree.get_last_finalized().hash;
        let mut chain = Vec::new();
        for number in 1..=length {
            parent = tree
                .add_block_header(&header(parent, number, number as u8))
                .expect("add");
            chain.push(parent);
        }
        chain
    }

    #[test]
    fn round_finalizes_with_supermajority() {
        let fixture = fixture();
        let chain = extend_chain(&fixture, 3);
        let tip = *chain.last().expect("tip");

        let mut round = VotingRound::new(1, fixture.voters.clone(), fixture.env.clone());
        for secret in &fixture.secrets[..2] {
            round.cast_prevote(secret).expect("prevote");
        }
        assert_eq!(round.state(), RoundState::Precommitting);
        assert_eq!(round.prevote_ghost().expect("ghost").hash, tip);

        for secret in &fixture.secrets[..2] {
            round.cast_precommit(secret).expect("precommit");
        }
        assert_eq!(round.state(), RoundState::Completed);
        assert_eq!(round.finalized().expect("finalized").hash, tip);

        // the tree advanced and the justification decodes and verifies
        let finalized = fixture.tree.read().expect("lock").get_last_finalized();
        assert_eq!(finalized.hash, tip);
        let stored = fixture
            .storage
            .get_justification(&BlockId::Hash(tip))
            .expect("justification");
        let justification = {
            use taskmesh_scale::ScaleDecode;
            FinalityJustification::decode(&stored.0).expect("decode")
        };
        justification.verify(&fixture.voters).expect("valid");
    }

    #[test]
    fn ghost_settles_on_common_ancestor_across_forks() {
        let fixture = fixture();
        let genesis = fixture.tree.read().expect("lock").get_last_finalized().hash;
        let (a1, a2, b1) = {
            let mut tree = fixture.tree.write().expect("lock");
            let a1 = tree.add_block_header(&header(genesis, 1, 1)).expect("add");
            let a2 = tree.add_block_header(&header(a1, 2, 2)).expect("add");
            let b1 = tree.add_block_header(&header(genesis, 1, 3)).expect("add");
            (a1, a2, b1)
        };

        let mut round = VotingRound::new(1, fixture.voters.clone(), fixture.env.clone());
        // two votes on the a-fork, one on the b-fork
        for (secret, target) in fixture.secrets.iter().zip([a2, a1, b1]) {
            let number = fixture
                .env
                .headers()
                .number_by_hash(&target)
                .expect("number");
            let signed = SignedVote::sign(
                secret,
                Vote {
                    stage: VoteStage::Prevote,
                    target: BlockInfo::new(number, target),
                },
                1,
                1,
            );
            round.on_signed_vote(signed).expect("vote");
        }
        // only genesis and a1 carry supermajority; a1 is deeper
        assert_eq!(round.prevote_ghost().expect("ghost").hash, a1);
    }

    #[test]
    fn duplicate_and_foreign_votes_are_rejected() {
        let fixture = fixture();
        extend_chain(&fixture, 1);
        let mut round = VotingRound::new(1, fixture.voters.clone(), fixture.env.clone());
        round.cast_prevote(&fixture.secrets[0]).expect("prevote");
        let duplicate = SignedVote::sign(
            &fixture.secrets[0],
            Vote {
                stage: VoteStage::Prevote,
                target: fixture.env.last_finalized().expect("finalized"),
            },
            1,
            1,
        );
        assert!(matches!(
            round.on_signed_vote(duplicate),
            Err(FinalityError::DuplicateVote)
        ));

        let outsider = SignedVote::sign(
            &secret(9),
            Vote {
                stage: VoteStage::Prevote,
                target: fixture.env.last_finalized().expect("finalized"),
            },
            1,
            1,
        );
        assert!(matches!(
            round.on_signed_vote(outsider),
            Err(FinalityError::UnknownVoter)
        ));
    }

    #[tokio::test]
    async fn stalled_round_completes_on_timeout() {
        let fixture = fixture();
        extend_chain(&fixture, 1);
        let finality = Finality::new(
            fixture.env.clone(),
            Duration::from_millis(20),
            Some(fixture.secrets[0]),
        );
        let (_tx, mut rx) = mpsc::channel(8);
        let round = finality.run_round(1, fixture.voters.clone(), &mut rx).await;
        assert_eq!(round.state(), RoundState::Completed);
        assert!(round.finalized().is_none());
    }

    #[tokio::test]
    async fn driven_round_finalizes_from_the_wire() {
        let fixture = fixture();
        let chain = extend_chain(&fixture, 2);
        let tip = *chain.last().expect("tip");
        let finality = Finality::new(
            fixture.env.clone(),
            Duration::from_millis(500),
            Some(fixture.secrets[0]),
        );
        let (tx, mut rx) = mpsc::channel(8);

        let target = BlockInfo::new(2, tip);
        for secret in &fixture.secrets[1..] {
            tx.send(SignedVote::sign(
                secret,
                Vote {
                    stage: VoteStage::Prevote,
                    target,
                },
                1,
                1,
            ))
            .await
            .expect("send");
        }
        for secret in &fixture.secrets[1..] {
            tx.send(SignedVote::sign(
                secret,
                Vote {
                    stage: VoteStage::Precommit,
                    target,
                },
                1,
                1,
            ))
            .await
            .expect("send");
        }

        let round = finality.run_round(1, fixture.voters.clone(), &mut rx).await;
        assert_eq!(round.finalized().expect("finalized").hash, tip);
    }
}
