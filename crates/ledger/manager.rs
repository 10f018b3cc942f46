use ethereum_types::{H256, U256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use taskmesh_common::{Block, BlockHeader, BlockId, Extrinsic, Hasher};
use taskmesh_scale::{ScaleDecode, ScaleEncode};
use taskmesh_storage::{BlockStorage, KvStore};
use taskmesh_trie::ordered_trie_root;
use tracing::{debug, info, warn};

use crate::account::{Account, InputRef};
use crate::error::LedgerError;
use crate::transaction::{DagHeader, OutputDest, Transaction};

/// Called when every subtask of an escrowed job has reported completion:
/// `(job hash hex, completed subtask ids)`.
pub type ProcessingFinishedCb =
    Box<dyn Fn(&str, &std::collections::BTreeSet<String>) + Send + Sync>;

/// Book-keeping for one held escrow until its payout or refund lands
/// on-chain.
#[derive(Debug, Clone)]
pub struct EscrowCtrl {
    pub dev_addr: U256,
    pub dev_cut: f32,
    pub job_hash: H256,
    pub full_amount: u64,
    pub num_subtasks: u64,
    pub original_input: InputRef,
    pub payout_peers: Vec<OutputDest>,
    /// subtask id -> reporting worker address
    pub subtask_info: BTreeMap<String, U256>,
}

/// Builds, signs and publishes this node's transactions and keeps the
/// account's UTXO set in step with the finalized chain.
///
/// Outgoing transactions are appended to the replicated chain storage; the
/// sync loop reads back every new block (ours and everyone else's) and
/// reconciles the account.
pub struct TransactionManager {
    db: Arc<dyn KvStore>,
    block_storage: Arc<BlockStorage>,
    account: Mutex<Account>,
    outgoing: Mutex<std::collections::VecDeque<Transaction>>,
    escrows: Mutex<Vec<EscrowCtrl>>,
    last_block_number: AtomicU64,
    processing_finished_cb: Option<ProcessingFinishedCb>,
    net_id: u16,
}

impl TransactionManager {
    pub const MAIN_NET_ID: u16 = 369;
    pub const TEST_NET_ID: u16 = 963;

    pub fn new(
        db: Arc<dyn KvStore>,
        block_storage: Arc<BlockStorage>,
        account: Account,
        net_id: u16,
        processing_finished_cb: Option<ProcessingFinishedCb>,
    ) -> Self {
        Self {
            db,
            block_storage,
            account: Mutex::new(account),
            outgoing: Mutex::new(std::collections::VecDeque::new()),
            escrows: Mutex::new(Vec::new()),
            last_block_number: AtomicU64::new(0),
            processing_finished_cb,
            net_id,
        }
    }

    pub fn address(&self) -> U256 {
        self.account
            .lock()
            .map(|account| account.address)
            .unwrap_or_default()
    }

    pub fn balance(&self) -> u64 {
        self.account
            .lock()
            .map(|account| {
                let token = account.token_id;
                account.balance(token)
            })
            .unwrap_or(0)
    }

    /// Moves `amount` to `destination`, paying change back to ourselves.
    pub fn transfer_funds(
        &self,
        amount: u64,
        destination: U256,
    ) -> Result<U256, LedgerError> {
        let mut tx = {
            let mut account = self.account.lock().map_err(|_| LedgerError::LockError)?;
            let (inputs, change) = account.select_inputs(amount)?;
            let mut outputs = vec![OutputDest {
                dest: destination,
                amount,
            }];
            if change > 0 {
                outputs.push(OutputDest {
                    dest: account.address,
                    amount: change,
                });
            }
            let header = self.fill_dag_header(&mut account);
            Transaction::Transfer {
                header,
                token_id: account.token_id,
                inputs,
                outputs,
            }
        };
        self.sign_and_send(&mut tx)?;
        Ok(tx.txid())
    }

    /// Produces `amount` fresh tokens to ourselves. Whether this node is
    /// allowed to mint is enforced by block validation, not here.
    pub fn mint_funds(&self, amount: u64) -> Result<U256, LedgerError> {
        let mut tx = {
            let mut account = self.account.lock().map_err(|_| LedgerError::LockError)?;
            let header = self.fill_dag_header(&mut account);
            Transaction::Mint {
                header,
                token_id: account.token_id,
                amount,
            }
        };
        self.sign_and_send(&mut tx)?;
        Ok(tx.txid())
    }

    /// Reserves a single output covering `amount` for the job and announces
    /// the escrow on-chain.
    pub fn hold_escrow(
        &self,
        amount: u64,
        num_chunks: u64,
        dev_addr: U256,
        dev_cut: f32,
        job_id: &str,
    ) -> Result<H256, LedgerError> {
        let job_hash = Hasher::blake2b_256(job_id.as_bytes());
        let mut tx = {
            let mut account = self.account.lock().map_err(|_| LedgerError::LockError)?;
            let original_input = account.lock_single_covering(amount)?;
            self.escrows
                .lock()
                .map_err(|_| LedgerError::LockError)?
                .push(EscrowCtrl {
                    dev_addr,
                    dev_cut,
                    job_hash,
                    full_amount: amount,
                    num_subtasks: num_chunks,
                    original_input,
                    payout_peers: Vec::new(),
                    subtask_info: BTreeMap::new(),
                });
            let header = self.fill_dag_header(&mut account);
            Transaction::Escrow {
                header,
                token_id: account.token_id,
                amount,
                num_chunks,
                original_input,
                job_hash,
            }
        };
        self.sign_and_send(&mut tx)?;
        info!(job = %job_hash, amount, num_chunks, "escrow held");
        Ok(job_hash)
    }

    /// Records a completed subtask. Once every chunk of the escrow has
    /// reported, the payout transaction is synthesized: each worker gets
    /// `floor(full * (1 - dev_cut) / chunks)`, the remainder goes to the
    /// developer address, and the reserved output is spent.
    pub fn processing_done(
        &self,
        subtask_id: &str,
        peer: U256,
    ) -> Result<Option<U256>, LedgerError> {
        let payout = {
            let mut escrows = self.escrows.lock().map_err(|_| LedgerError::LockError)?;
            let escrow = escrows
                .iter_mut()
                .find(|escrow| {
                    (escrow.subtask_info.len() as u64) < escrow.num_subtasks
                        && !escrow.subtask_info.contains_key(subtask_id)
                })
                .ok_or(LedgerError::EscrowNotFound)?;
            escrow.subtask_info.insert(subtask_id.to_string(), peer);
            debug!(
                job = %escrow.job_hash,
                done = escrow.subtask_info.len(),
                of = escrow.num_subtasks,
                "subtask reported"
            );
            if escrow.subtask_info.len() as u64 == escrow.num_subtasks {
                let per_peer = ((escrow.full_amount as f64)
                    * (1.0 - f64::from(escrow.dev_cut))
                    / (escrow.num_subtasks as f64))
                    .floor() as u64;
                let dev_amount = escrow.full_amount - per_peer * escrow.num_subtasks;
                let mut outputs: Vec<OutputDest> = escrow
                    .subtask_info
                    .values()
                    .map(|worker| OutputDest {
                        dest: *worker,
                        amount: per_peer,
                    })
                    .collect();
                if dev_amount > 0 {
                    outputs.push(OutputDest {
                        dest: escrow.dev_addr,
                        amount: dev_amount,
                    });
                }
                escrow.payout_peers = outputs.clone();
                Some((escrow.original_input, outputs, escrow.job_hash))
            } else {
                None
            }
        };
        let Some((input, outputs, job_hash)) = payout else {
            return Ok(None);
        };
        let mut tx = {
            let mut account = self.account.lock().map_err(|_| LedgerError::LockError)?;
            let header = self.fill_dag_header(&mut account);
            Transaction::ProcessingPayout {
                header,
                token_id: account.token_id,
                input,
                outputs,
                job_hash,
            }
        };
        self.sign_and_send(&mut tx)?;
        info!(job = %job_hash, "escrow payout published");
        Ok(Some(tx.txid()))
    }

    /// Aborts or settles an escrow. With `pay == false` the full amount is
    /// refunded to the original owner.
    pub fn release_escrow(&self, job_id: &str, pay: bool) -> Result<(), LedgerError> {
        let job_hash = Hasher::blake2b_256(job_id.as_bytes());
        let escrow = {
            let mut escrows = self.escrows.lock().map_err(|_| LedgerError::LockError)?;
            let position = escrows
                .iter()
                .position(|escrow| escrow.job_hash == job_hash)
                .ok_or(LedgerError::EscrowNotFound)?;
            if pay {
                // settled through the payout path; nothing to refund
                return Ok(());
            }
            escrows.remove(position)
        };
        let mut tx = {
            let mut account = self.account.lock().map_err(|_| LedgerError::LockError)?;
            let header = self.fill_dag_header(&mut account);
            Transaction::Transfer {
                header,
                token_id: account.token_id,
                inputs: vec![escrow.original_input],
                outputs: vec![OutputDest {
                    dest: account.address,
                    amount: escrow.full_amount,
                }],
            }
        };
        self.sign_and_send(&mut tx)?;
        info!(job = %job_hash, "escrow refunded");
        Ok(())
    }

    /// Reads every block finalized since the last pass and reconciles the
    /// account and escrows against their transactions.
    pub fn check_blockchain(&self) -> Result<usize, LedgerError> {
        let head_hash = self.block_storage.last_finalized_block_hash()?;
        let head = self
            .block_storage
            .get_block_header(&BlockId::Hash(head_hash))?;
        let mut processed = 0;
        let mut last = self.last_block_number.load(Ordering::SeqCst);
        while last < head.number {
            last += 1;
            let Ok(body) = self.block_storage.get_block_body(&BlockId::Number(last)) else {
                continue;
            };
            for extrinsic in body {
                match Transaction::decode(&extrinsic.0) {
                    Ok(tx) => {
                        self.apply_transaction(tx)?;
                        processed += 1;
                    }
                    Err(err) => debug!(%err, block = last, "skipping undecodable extrinsic"),
                }
            }
        }
        self.last_block_number.store(last, Ordering::SeqCst);
        Ok(processed)
    }

    /// Periodic chain-sync loop.
    pub fn spawn_sync_loop(
        self: &Arc<Self>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = manager.check_blockchain() {
                    warn!(%err, "chain sync pass failed");
                }
            }
        })
    }

    fn apply_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        if let Err(err) = tx.verify() {
            // a bad signature discards the transaction, nothing more
            warn!(%err, "dropping transaction with invalid signature");
            return Ok(());
        }
        let txid = tx.txid();
        {
            let mut account = self.account.lock().map_err(|_| LedgerError::LockError)?;
            match &tx {
                Transaction::Transfer {
                    header,
                    token_id,
                    inputs,
                    outputs,
                } => {
                    if header.source == account.address {
                        account.refresh_utxos(inputs);
                    }
                    credit_outputs(&mut account, txid, *token_id, outputs);
                }
                Transaction::Mint {
                    header,
                    token_id,
                    amount,
                } => {
                    if header.source == account.address {
                        account.put_utxo(crate::account::Utxo {
                            txid_hash: txid,
                            output_idx: 0,
                            amount: *amount,
                            token_id: *token_id,
                            locked: false,
                        });
                    }
                }
                Transaction::Escrow { .. } => {
                    // the reserved output stays locked until payout or refund
                }
                Transaction::ProcessingPayout {
                    header,
                    token_id,
                    input,
                    outputs,
                    ..
                } => {
                    if header.source == account.address {
                        account.refresh_utxos(&[*input]);
                    }
                    credit_outputs(&mut account, txid, *token_id, outputs);
                }
            }
        }
        if let Transaction::ProcessingPayout { job_hash, .. } = &tx {
            self.settle_escrow(job_hash)?;
        }
        Ok(())
    }

    fn settle_escrow(&self, job_hash: &H256) -> Result<(), LedgerError> {
        let settled = {
            let mut escrows = self.escrows.lock().map_err(|_| LedgerError::LockError)?;
            escrows
                .iter()
                .position(|escrow| escrow.job_hash == *job_hash)
                .map(|position| escrows.remove(position))
        };
        if let Some(escrow) = settled {
            info!(job = %escrow.job_hash, "escrow settled on-chain");
            if let Some(cb) = &self.processing_finished_cb {
                let subtasks: std::collections::BTreeSet<String> =
                    escrow.subtask_info.keys().cloned().collect();
                cb(&hex::encode(escrow.job_hash), &subtasks);
            }
        }
        Ok(())
    }

    fn fill_dag_header(&self, account: &mut Account) -> DagHeader {
        let header = DagHeader {
            data_hash: H256::zero(),
            prev_hash: H256::zero(),
            source: account.address,
            nonce: account.nonce,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            signature: Vec::new(),
        };
        account.nonce += 1;
        header
    }

    fn sign_and_send(&self, tx: &mut Transaction) -> Result<(), LedgerError> {
        {
            let account = self.account.lock().map_err(|_| LedgerError::LockError)?;
            tx.sign(account.secret());
        }
        self.outgoing
            .lock()
            .map_err(|_| LedgerError::LockError)?
            .push_back(tx.clone());
        self.send_transaction()
    }

    // Drains the outgoing queue: each transaction is published under the
    // network namespace and appended to the chain as a block body entry.
    fn send_transaction(&self) -> Result<(), LedgerError> {
        loop {
            let Some(tx) = self
                .outgoing
                .lock()
                .map_err(|_| LedgerError::LockError)?
                .pop_front()
            else {
                return Ok(());
            };
            let encoded = tx.encode_to_vec();
            let tx_key = format!("bc-{}/tx/{}", self.net_id, tx.txid());
            self.db.put(tx_key.as_bytes(), &encoded)?;

            let parent_hash = self.block_storage.last_finalized_block_hash()?;
            let parent = self
                .block_storage
                .get_block_header(&BlockId::Hash(parent_hash))?;
            let body = vec![Extrinsic::new(encoded)];
            let block = Block {
                header: BlockHeader {
                    parent_hash,
                    number: parent.number + 1,
                    state_root: parent.state_root,
                    extrinsics_root: ordered_trie_root(
                        body.iter().map(|extrinsic| extrinsic.encode_to_vec()),
                    ),
                    digest: vec![],
                },
                body,
            };
            let hash = self.block_storage.put_block(&block)?;
            self.block_storage.set_last_finalized_block_hash(&hash)?;
            debug!(block = %hash, number = block.header.number, "transaction appended to chain");
        }
    }
}

fn credit_outputs(
    account: &mut Account,
    txid: U256,
    token_id: u8,
    outputs: &[OutputDest],
) {
    for (index, output) in outputs.iter().enumerate() {
        if output.dest == account.address {
            account.put_utxo(crate::account::Utxo {
                txid_hash: txid,
                output_idx: index as u32,
                amount: output.amount,
                token_id,
                locked: false,
            });
        }
    }
}
