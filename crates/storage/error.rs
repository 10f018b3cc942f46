use taskmesh_scale::ScaleDecodeError;
use taskmesh_trie::TrieError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Block with such ID is not found")]
    BlockNotFound,
    #[error("Block body does not exist")]
    BodyDoesNotExist,
    #[error("Justification does not exist")]
    JustificationDoesNotExist,
    #[error("Block is already in the storage")]
    BlockExists,
    #[error("Genesis block is already in the storage")]
    GenesisBlockAlreadyExists,
    #[error("Genesis block is not found")]
    GenesisBlockNotFound,
    #[error("Last finalized block is not found")]
    FinalizedBlockNotFound,
    #[error(transparent)]
    ScaleDecode(#[from] ScaleDecodeError),
    #[error(transparent)]
    Trie(#[from] TrieError),
    #[error("Failed to lock the store for access")]
    LockError,
    #[error("{0}")]
    Custom(String),
}
