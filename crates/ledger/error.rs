use taskmesh_scale::ScaleDecodeError;
use taskmesh_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Account balance cannot cover the requested amount")]
    InsufficientFunds,
    #[error("No single unlocked output can cover the escrow amount")]
    NoSuitableOutput,
    #[error("No escrow is registered under the given job")]
    EscrowNotFound,
    #[error("Transaction signature does not verify")]
    BadSignature,
    #[error("Malformed transaction payload")]
    MalformedTransaction,
    #[error("DB error: {0}")]
    StoreError(#[from] StoreError),
    #[error(transparent)]
    ScaleDecode(#[from] ScaleDecodeError),
    #[error("Failed to lock ledger state")]
    LockError,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("DB error: {0}")]
    StoreError(#[from] StoreError),
    #[error(transparent)]
    ScaleDecode(#[from] ScaleDecodeError),
    #[error("Task {0} is already completed")]
    AlreadyCompleted(String),
    #[error("System clock is before the unix epoch")]
    ClockSkew,
}
