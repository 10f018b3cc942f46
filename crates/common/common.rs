// Keep H256, H160, H512, U256 from ethereum_types
pub use ethereum_types::{Address, H160, H256, H512, U256};

pub use bytes::Bytes;

pub mod hasher;
pub mod types;

pub use hasher::Hasher;
pub use types::{
    Authority, AuthorityId, AuthorityList, Block, BlockBody, BlockData, BlockHeader, BlockId,
    BlockInfo, BlockNumber, Digest, DigestItem, EngineId, Extrinsic, Justification,
    VerificationDigest,
};
