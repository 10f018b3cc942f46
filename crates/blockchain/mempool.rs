use ethereum_types::H256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use taskmesh_common::{BlockId, BlockNumber, Extrinsic};
use taskmesh_storage::BlockHeaderRepository;
use tracing::{debug, trace};

use crate::error::PoolError;

pub type Tag = Vec<u8>;

/// A transaction as the pool sees it: the opaque extrinsic plus the
/// dependency metadata produced by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTransaction {
    pub ext: Extrinsic,
    /// Size of the encoded transaction.
    pub bytes: usize,
    pub hash: H256,
    /// Higher is better; additive.
    pub priority: u64,
    /// Block number past which the transaction is stale.
    pub valid_till: BlockNumber,
    pub requires: Vec<Tag>,
    pub provides: Vec<Tag>,
    pub should_propagate: bool,
}

/// Pre-import check. The deployed network resolves this through the runtime's
/// transaction queue; locally the structural rules below stand in.
pub trait TransactionValidator: Send + Sync {
    fn validate(&self, tx: &PoolTransaction) -> Result<(), PoolError>;
}

/// Accepts transactions whose hash matches their payload and that provide at
/// least one tag.
#[derive(Debug, Default)]
pub struct StructuralValidator;

impl TransactionValidator for StructuralValidator {
    fn validate(&self, tx: &PoolTransaction) -> Result<(), PoolError> {
        if tx.hash != tx.ext.hash() {
            return Err(PoolError::Invalid(
                "transaction hash does not match payload".into(),
            ));
        }
        if tx.provides.is_empty() {
            return Err(PoolError::Invalid("transaction provides no tags".into()));
        }
        Ok(())
    }
}

/// Bans transactions for a fixed amount of time so stale or invalid ones do
/// not keep re-entering the pool.
pub struct PoolModerator {
    ban_for: Duration,
    banned: Mutex<HashMap<H256, Instant>>,
}

impl PoolModerator {
    pub const DEFAULT_BAN_FOR: Duration = Duration::from_secs(30 * 60);

    pub fn new(ban_for: Duration) -> Self {
        Self {
            ban_for,
            banned: Mutex::new(HashMap::new()),
        }
    }

    pub fn ban(&self, tx_hash: &H256) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(*tx_hash, Instant::now() + self.ban_for);
        }
    }

    /// Bans `tx` if its longevity is past `current_block`.
    pub fn ban_if_stale(&self, current_block: BlockNumber, tx: &PoolTransaction) -> bool {
        if tx.valid_till > current_block {
            return false;
        }
        self.ban(&tx.hash);
        true
    }

    pub fn is_banned(&self, tx_hash: &H256) -> bool {
        self.banned
            .lock()
            .map(|banned| banned.contains_key(tx_hash))
            .unwrap_or(false)
    }

    /// Unbans transactions whose ban time is exceeded.
    pub fn update_ban(&self) {
        let now = Instant::now();
        if let Ok(mut banned) = self.banned.lock() {
            banned.retain(|_, until| *until > now);
        }
    }

    pub fn banned_num(&self) -> usize {
        self.banned.lock().map(|banned| banned.len()).unwrap_or(0)
    }
}

impl Default for PoolModerator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BAN_FOR)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_ready: usize,
    pub capacity: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_ready: 512,
            capacity: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub ready: usize,
    pub waiting: usize,
}

struct Imported {
    tx: PoolTransaction,
    // submission sequence; orders equal-priority transactions
    seq: u64,
    ready: bool,
}

#[derive(Default)]
struct PoolInner {
    imported: HashMap<H256, Imported>,
    ready: HashSet<H256>,
    postponed: VecDeque<H256>,
    provided_tags: HashMap<Tag, Vec<H256>>,
    waiting_on_tag: HashMap<Tag, Vec<H256>>,
    next_seq: u64,
    last_seen_number: BlockNumber,
}

/// Transaction pool with tag-based dependency resolution.
///
/// A transaction is ready once every tag it requires is provided by another
/// ready transaction; the rest wait. All public methods are atomic behind
/// one lock.
pub struct TransactionPool {
    inner: Mutex<PoolInner>,
    moderator: Arc<PoolModerator>,
    validator: Box<dyn TransactionValidator>,
    headers: Arc<BlockHeaderRepository>,
    limits: PoolLimits,
}

impl TransactionPool {
    pub fn new(
        moderator: Arc<PoolModerator>,
        validator: Box<dyn TransactionValidator>,
        headers: Arc<BlockHeaderRepository>,
        limits: PoolLimits,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            moderator,
            validator,
            headers,
            limits,
        }
    }

    pub fn submit_one(&self, tx: PoolTransaction) -> Result<(), PoolError> {
        if self.moderator.is_banned(&tx.hash) {
            return Err(PoolError::Banned);
        }
        self.validator.validate(&tx)?;

        let mut inner = self.inner.lock().map_err(|_| PoolError::LockError)?;
        if self.moderator.ban_if_stale(inner.last_seen_number, &tx) {
            return Err(PoolError::Stale(tx.valid_till));
        }
        if inner.imported.contains_key(&tx.hash) {
            return Err(PoolError::AlreadyImported);
        }

        let hash = tx.hash;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        trace!(tx = %hash, seq, "importing transaction");
        inner.imported.insert(
            hash,
            Imported {
                tx,
                seq,
                ready: false,
            },
        );
        Self::process_transaction(&mut inner, hash, self.limits.max_ready);
        self.enforce_capacity(&mut inner);
        Ok(())
    }

    pub fn submit(&self, txs: Vec<PoolTransaction>) -> Result<(), PoolError> {
        for tx in txs {
            self.submit_one(tx)?;
        }
        Ok(())
    }

    pub fn remove_one(&self, tx_hash: &H256) -> Result<PoolTransaction, PoolError> {
        let mut inner = self.inner.lock().map_err(|_| PoolError::LockError)?;
        Self::extract(&mut inner, tx_hash).ok_or(PoolError::TransactionNotFound)
    }

    pub fn remove(&self, tx_hashes: &[H256]) -> Result<Vec<PoolTransaction>, PoolError> {
        let mut inner = self.inner.lock().map_err(|_| PoolError::LockError)?;
        Ok(tx_hashes
            .iter()
            .filter_map(|hash| Self::extract(&mut inner, hash))
            .collect())
    }

    /// Stable snapshot of the ready set: insertion order for equal
    /// priorities, higher priority first.
    pub fn get_ready_transactions(&self) -> Vec<PoolTransaction> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut ready: Vec<&Imported> = inner
            .ready
            .iter()
            .filter_map(|hash| inner.imported.get(hash))
            .collect();
        ready.sort_by(|a, b| b.tx.priority.cmp(&a.tx.priority).then(a.seq.cmp(&b.seq)));
        ready.into_iter().map(|imported| imported.tx.clone()).collect()
    }

    /// Drops and bans every transaction whose longevity ends at or before
    /// the block `at` resolves to.
    pub fn remove_stale(&self, at: &BlockId) -> Result<Vec<PoolTransaction>, PoolError> {
        let number = self.headers.get_block_header(at)?.number;
        let mut inner = self.inner.lock().map_err(|_| PoolError::LockError)?;
        inner.last_seen_number = number;
        let stale: Vec<H256> = inner
            .imported
            .values()
            .filter(|imported| imported.tx.valid_till <= number)
            .map(|imported| imported.tx.hash)
            .collect();
        let mut removed = Vec::new();
        for hash in stale {
            if let Some(tx) = Self::extract(&mut inner, &hash) {
                debug!(tx = %hash, "dropping stale transaction");
                self.moderator.ban(&hash);
                removed.push(tx);
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> PoolStatus {
        let Ok(inner) = self.inner.lock() else {
            return PoolStatus { ready: 0, waiting: 0 };
        };
        PoolStatus {
            ready: inner.ready.len(),
            waiting: inner.imported.len() - inner.ready.len(),
        }
    }

    // Attempts to mark the transaction ready; otherwise files it as waiting
    // or postponed.
    fn process_transaction(inner: &mut PoolInner, hash: H256, max_ready: usize) {
        let Some(imported) = inner.imported.get(&hash) else {
            return;
        };
        if imported.ready {
            return;
        }
        let unresolved: Vec<Tag> = imported
            .tx
            .requires
            .iter()
            .filter(|tag| !inner.provided_tags.contains_key(*tag))
            .cloned()
            .collect();
        if unresolved.is_empty() {
            if inner.ready.len() < max_ready {
                Self::set_ready(inner, hash, max_ready);
            } else {
                inner.postponed.push_back(hash);
            }
        } else {
            for tag in unresolved {
                inner.waiting_on_tag.entry(tag).or_default().push(hash);
            }
        }
    }

    // Marks ready, records provided tags and promotes whoever waited on
    // them.
    fn set_ready(inner: &mut PoolInner, hash: H256, max_ready: usize) {
        let Some(imported) = inner.imported.get_mut(&hash) else {
            return;
        };
        imported.ready = true;
        let provides = imported.tx.provides.clone();
        inner.ready.insert(hash);
        let mut to_promote = Vec::new();
        for tag in provides {
            inner.provided_tags.entry(tag.clone()).or_default().push(hash);
            if let Some(waiters) = inner.waiting_on_tag.remove(&tag) {
                to_promote.extend(waiters);
            }
        }
        for waiter in to_promote {
            Self::process_transaction(inner, waiter, max_ready);
        }
    }

    // Removes the transaction and demotes ready transactions that lost a
    // required tag.
    fn extract(inner: &mut PoolInner, hash: &H256) -> Option<PoolTransaction> {
        let imported = inner.imported.remove(hash)?;
        inner.ready.remove(hash);
        inner.postponed.retain(|postponed| postponed != hash);
        for waiters in inner.waiting_on_tag.values_mut() {
            waiters.retain(|waiter| waiter != hash);
        }
        inner.waiting_on_tag.retain(|_, waiters| !waiters.is_empty());

        let mut orphaned_tags = Vec::new();
        for tag in &imported.tx.provides {
            if let Some(providers) = inner.provided_tags.get_mut(tag) {
                providers.retain(|provider| provider != hash);
                if providers.is_empty() {
                    inner.provided_tags.remove(tag);
                    orphaned_tags.push(tag.clone());
                }
            }
        }
        for tag in orphaned_tags {
            Self::demote_dependents(inner, &tag);
        }
        Some(imported.tx)
    }

    // A tag lost its last provider: everything requiring it goes back to
    // waiting, recursively unwinding tags they provided.
    fn demote_dependents(inner: &mut PoolInner, tag: &Tag) {
        let dependents: Vec<H256> = inner
            .ready
            .iter()
            .filter(|hash| {
                inner
                    .imported
                    .get(*hash)
                    .is_some_and(|imported| imported.tx.requires.contains(tag))
            })
            .copied()
            .collect();
        for hash in dependents {
            inner.ready.remove(&hash);
            if let Some(imported) = inner.imported.get_mut(&hash) {
                imported.ready = false;
            }
            inner
                .waiting_on_tag
                .entry(tag.clone())
                .or_default()
                .push(hash);
            let provides = inner
                .imported
                .get(&hash)
                .map(|imported| imported.tx.provides.clone())
                .unwrap_or_default();
            for provided in provides {
                if let Some(providers) = inner.provided_tags.get_mut(&provided) {
                    providers.retain(|provider| provider != &hash);
                    if providers.is_empty() {
                        inner.provided_tags.remove(&provided);
                        Self::demote_dependents(inner, &provided);
                    }
                }
            }
        }
    }

    // Over capacity: evict the lowest-priority postponed transaction.
    fn enforce_capacity(&self, inner: &mut PoolInner) {
        while inner.imported.len() > self.limits.capacity {
            let victim = inner
                .postponed
                .iter()
                .min_by_key(|hash| {
                    inner
                        .imported
                        .get(*hash)
                        .map(|imported| imported.tx.priority)
                        .unwrap_or(u64::MAX)
                })
                .copied();
            match victim {
                Some(hash) => {
                    debug!(tx = %hash, "evicting postponed transaction over capacity");
                    Self::extract(inner, &hash);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_common::BlockHeader;
    use taskmesh_storage::InMemoryKvStore;

    fn headers() -> Arc<BlockHeaderRepository> {
        let repo = Arc::new(BlockHeaderRepository::new(Arc::new(InMemoryKvStore::new())));
        repo.put_block_header(&BlockHeader {
            number: 10,
            ..Default::default()
        })
        .expect("put header");
        repo
    }

    fn pool() -> TransactionPool {
        TransactionPool::new(
            Arc::new(PoolModerator::default()),
            Box::new(StructuralValidator),
            headers(),
            PoolLimits::default(),
        )
    }

    fn tx(payload: &[u8], requires: &[&[u8]], provides: &[&[u8]]) -> PoolTransaction {
        tx_with_priority(payload, requires, provides, 1)
    }

    fn tx_with_priority(
        payload: &[u8],
        requires: &[&[u8]],
        provides: &[&[u8]],
        priority: u64,
    ) -> PoolTransaction {
        let ext = Extrinsic::new(payload.to_vec());
        PoolTransaction {
            hash: ext.hash(),
            bytes: payload.len(),
            ext,
            priority,
            valid_till: u64::MAX,
            requires: requires.iter().map(|tag| tag.to_vec()).collect(),
            provides: provides.iter().map(|tag| tag.to_vec()).collect(),
            should_propagate: true,
        }
    }

    #[test]
    fn dependent_transaction_is_promoted() {
        let pool = pool();
        let t1 = tx(b"t1", &[], &[b"a"]);
        let t2 = tx(b"t2", &[b"a"], &[b"b"]);

        // submitted in dependency order
        pool.submit_one(t1.clone()).expect("submit");
        pool.submit_one(t2.clone()).expect("submit");
        let ready = pool.get_ready_transactions();
        assert_eq!(ready.len(), 2);

        // removing the provider retires the dependent to waiting
        pool.remove_one(&t1.hash).expect("remove");
        assert_eq!(pool.get_ready_transactions().len(), 0);
        assert_eq!(pool.status(), PoolStatus { ready: 0, waiting: 1 });
    }

    #[test]
    fn waiting_transaction_becomes_ready_when_provider_arrives() {
        let pool = pool();
        let t2 = tx(b"t2", &[b"a"], &[b"b"]);
        let t1 = tx(b"t1", &[], &[b"a"]);

        // dependency submitted first: waits
        pool.submit_one(t2.clone()).expect("submit");
        assert_eq!(pool.status(), PoolStatus { ready: 0, waiting: 1 });

        pool.submit_one(t1).expect("submit");
        assert_eq!(pool.status(), PoolStatus { ready: 2, waiting: 0 });
    }

    #[test]
    fn promotion_cascades_through_chains() {
        let pool = pool();
        let t3 = tx(b"t3", &[b"b"], &[b"c"]);
        let t2 = tx(b"t2", &[b"a"], &[b"b"]);
        let t1 = tx(b"t1", &[], &[b"a"]);
        pool.submit_one(t3).expect("submit");
        pool.submit_one(t2).expect("submit");
        pool.submit_one(t1).expect("submit");
        assert_eq!(pool.status(), PoolStatus { ready: 3, waiting: 0 });
    }

    #[test]
    fn equal_priority_keeps_insertion_order() {
        let pool = pool();
        let first = tx(b"first", &[], &[b"x"]);
        let second = tx(b"second", &[], &[b"y"]);
        pool.submit_one(first.clone()).expect("submit");
        pool.submit_one(second.clone()).expect("submit");
        let ready = pool.get_ready_transactions();
        assert_eq!(ready[0].hash, first.hash);
        assert_eq!(ready[1].hash, second.hash);

        // higher priority overtakes regardless of insertion order
        let urgent = tx_with_priority(b"urgent", &[], &[b"z"], 9);
        pool.submit_one(urgent.clone()).expect("submit");
        assert_eq!(pool.get_ready_transactions()[0].hash, urgent.hash);
    }

    #[test]
    fn duplicate_and_banned_submissions_fail() {
        let pool = pool();
        let t1 = tx(b"t1", &[], &[b"a"]);
        pool.submit_one(t1.clone()).expect("submit");
        assert!(matches!(
            pool.submit_one(t1.clone()),
            Err(PoolError::AlreadyImported)
        ));

        pool.moderator.ban(&t1.hash);
        pool.remove_one(&t1.hash).expect("remove");
        assert!(matches!(pool.submit_one(t1), Err(PoolError::Banned)));
    }

    #[test]
    fn stale_transactions_are_removed_and_banned() {
        let pool = pool();
        let mut doomed = tx(b"doomed", &[], &[b"a"]);
        doomed.valid_till = 5;
        let fresh = tx(b"fresh", &[], &[b"b"]);
        pool.submit_one(doomed.clone()).expect("submit");
        pool.submit_one(fresh.clone()).expect("submit");

        // the indexed header is number 10; longevity 5 is past
        let removed = pool.remove_stale(&BlockId::Number(10)).expect("removal");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].hash, doomed.hash);
        assert!(pool.moderator.is_banned(&doomed.hash));
        assert_eq!(pool.get_ready_transactions().len(), 1);

        // once stale is known, resubmission is refused outright
        let mut again = tx(b"doomed2", &[], &[b"c"]);
        again.valid_till = 5;
        assert!(matches!(pool.submit_one(again), Err(PoolError::Stale(5))));
    }

    #[test]
    fn capacity_evicts_lowest_priority_postponed() {
        let limits = PoolLimits {
            max_ready: 1,
            capacity: 2,
        };
        let pool = TransactionPool::new(
            Arc::new(PoolModerator::default()),
            Box::new(StructuralValidator),
            headers(),
            limits,
        );
        let keeper = tx_with_priority(b"keeper", &[], &[b"a"], 5);
        let mid = tx_with_priority(b"mid", &[], &[b"b"], 3);
        let low = tx_with_priority(b"low", &[], &[b"c"], 1);
        pool.submit_one(keeper).expect("submit");
        pool.submit_one(mid.clone()).expect("submit");
        pool.submit_one(low.clone()).expect("submit");

        let status = pool.status();
        assert_eq!(status.ready + status.waiting, 2);
        assert!(matches!(
            pool.remove_one(&low.hash),
            Err(PoolError::TransactionNotFound)
        ));
        assert!(pool.remove_one(&mid.hash).is_ok());
    }

    #[test]
    fn moderator_ban_expires() {
        let moderator = PoolModerator::new(Duration::from_millis(0));
        let hash = H256::repeat_byte(1);
        moderator.ban(&hash);
        assert_eq!(moderator.banned_num(), 1);
        moderator.update_ban();
        assert_eq!(moderator.banned_num(), 0);
    }
}
