use ethereum_types::H256;
use taskmesh_scale::ScaleDecodeError;
use taskmesh_storage::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Parent block not found")]
    ParentNotFound,
    #[error("Block {0:#x} is not in the tree")]
    BlockNotFound(H256),
    #[error("Block {0:#x} does not descend from the last finalized block")]
    NotDescendant(H256),
    #[error("DB error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Scale decode error: {0}")]
    ScaleDecode(#[from] ScaleDecodeError),
    #[error("Failed to lock the block tree")]
    LockError,
    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Transaction is already imported")]
    AlreadyImported,
    #[error("Transaction is not in the pool")]
    TransactionNotFound,
    #[error("Transaction is banned")]
    Banned,
    #[error("Transaction is stale (valid till block {0})")]
    Stale(u64),
    #[error("Transaction failed validation: {0}")]
    Invalid(String),
    #[error("Pool is full")]
    PoolOverflow,
    #[error("DB error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Failed to lock the transaction pool")]
    LockError,
}

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("No schedule node matches the given block")]
    NoScheduleNode,
    #[error("Authority index {0} is out of bounds")]
    BadAuthorityIndex(u64),
    #[error("A change is already scheduled at this node")]
    DuplicateChange,
    #[error("DB error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Scale decode error: {0}")]
    ScaleDecode(#[from] ScaleDecodeError),
    #[error("Failed to lock the authority scheduler")]
    LockError,
}

#[derive(Debug, Error)]
pub enum FinalityError {
    #[error("Vote signature does not verify")]
    BadSignature,
    #[error("Voter is not in the current authority set")]
    UnknownVoter,
    #[error("Duplicate vote for this round and stage")]
    DuplicateVote,
    #[error("Vote targets a block outside the known chain")]
    UnknownBlock,
    #[error("Justification carries insufficient vote weight")]
    InsufficientWeight,
    #[error("Round {0} is already completed")]
    RoundCompleted(u64),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Scale decode error: {0}")]
    ScaleDecode(#[from] ScaleDecodeError),
}

#[derive(Debug, Error)]
pub enum ProductionError {
    #[error("Not synchronized yet")]
    NotSynchronized,
    #[error("Node holds no authority slot in the current epoch")]
    NotAnAuthority,
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}
