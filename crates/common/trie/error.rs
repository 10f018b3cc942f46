use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Number of nibbles in the key is >= 2^16")]
    TooManyNibbles,
    #[error("Unknown trie node type")]
    UnknownNodeType,
    #[error("Not enough bytes in the input to decode a node")]
    InputTooSmall,
    #[error("No value in leaf node")]
    NoNodeValue,
    #[error("Malformed scale payload inside node encoding: {0}")]
    Scale(#[from] taskmesh_scale::ScaleDecodeError),
}

#[derive(Debug, Error)]
pub enum TrieError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("No value found under the given key")]
    NoValue,
    #[error("Trie node with merkle value {0} not found in the backend")]
    NodeNotFound(String),
    #[error("A dummy child was reached but the trie has no node loader")]
    NoLoader,
    #[error("Parent batch expired before the topper batch was written back")]
    ParentExpired,
    #[error("A persistent batch is already open for this storage")]
    BatchInUse,
    #[error("Lock Error: Panicked when trying to acquire a lock")]
    LockError,
    #[error("Invalid trie input")]
    InvalidInput,
}
