mod authority;
mod block;
mod digest;

pub use authority::{Authority, AuthorityId, AuthorityList, VerificationDigest};
pub use block::{
    Block, BlockBody, BlockData, BlockHeader, BlockId, BlockInfo, BlockNumber, Extrinsic,
    Justification,
};
pub use digest::{Digest, DigestItem, EngineId};
