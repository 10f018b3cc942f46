use ethereum_types::H256;
use std::sync::Arc;
use taskmesh_common::{BlockHeader, BlockId, BlockNumber};
use taskmesh_scale::{ScaleDecode, ScaleEncode};

use crate::api::KvStore;
use crate::error::StoreError;

const HASH_TO_HEADER_PREFIX: &[u8] = b"blockchain/h/";
const NUMBER_TO_HASH_PREFIX: &[u8] = b"blockchain/n/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    InChain,
    Unknown,
}

/// Bidirectional number <-> hash index plus header CRUD over the KV store.
pub struct BlockHeaderRepository {
    db: Arc<dyn KvStore>,
}

impl BlockHeaderRepository {
    pub fn new(db: Arc<dyn KvStore>) -> Self {
        Self { db }
    }

    /// Stores the header under its hash and indexes the hash by number.
    /// Returns the header hash.
    pub fn put_block_header(&self, header: &BlockHeader) -> Result<H256, StoreError> {
        let hash = header.hash();
        self.db
            .put(&header_key(&hash), &header.encode_to_vec())?;
        self.db
            .put(&number_key(header.number), hash.as_bytes())?;
        Ok(hash)
    }

    pub fn hash_by_number(&self, number: BlockNumber) -> Result<H256, StoreError> {
        let raw = self
            .db
            .get(&number_key(number))?
            .ok_or(StoreError::BlockNotFound)?;
        if raw.len() != 32 {
            return Err(StoreError::Custom(format!(
                "number index entry has {} bytes, expected 32",
                raw.len()
            )));
        }
        Ok(H256::from_slice(&raw))
    }

    pub fn number_by_hash(&self, hash: &H256) -> Result<BlockNumber, StoreError> {
        Ok(self.get_by_hash(hash)?.number)
    }

    pub fn get_block_header(&self, id: &BlockId) -> Result<BlockHeader, StoreError> {
        match id {
            BlockId::Hash(hash) => self.get_by_hash(hash),
            BlockId::Number(number) => {
                let hash = self.hash_by_number(*number)?;
                self.get_by_hash(&hash)
            }
        }
    }

    pub fn block_status(&self, id: &BlockId) -> Result<BlockStatus, StoreError> {
        let known = match id {
            BlockId::Hash(hash) => self.db.contains(&header_key(hash))?,
            BlockId::Number(number) => self.db.contains(&number_key(*number))?,
        };
        Ok(if known {
            BlockStatus::InChain
        } else {
            BlockStatus::Unknown
        })
    }

    pub fn remove_block_header(&self, id: &BlockId) -> Result<(), StoreError> {
        let header = self.get_block_header(id)?;
        self.db.remove(&header_key(&header.hash()))?;
        self.db.remove(&number_key(header.number))
    }

    fn get_by_hash(&self, hash: &H256) -> Result<BlockHeader, StoreError> {
        let raw = self
            .db
            .get(&header_key(hash))?
            .ok_or(StoreError::BlockNotFound)?;
        Ok(BlockHeader::decode(&raw)?)
    }
}

fn header_key(hash: &H256) -> Vec<u8> {
    [HASH_TO_HEADER_PREFIX, hash.as_bytes()].concat()
}

fn number_key(number: BlockNumber) -> Vec<u8> {
    [NUMBER_TO_HASH_PREFIX, number.to_be_bytes().as_slice()].concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_db::in_memory::InMemoryKvStore;

    fn repo() -> BlockHeaderRepository {
        BlockHeaderRepository::new(Arc::new(InMemoryKvStore::new()))
    }

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            parent_hash: H256::repeat_byte(number as u8),
            number,
            state_root: H256::repeat_byte(0x11),
            extrinsics_root: H256::repeat_byte(0x22),
            digest: vec![],
        }
    }

    #[test]
    fn index_works_both_ways() {
        let repo = repo();
        let header = header(42);
        let hash = repo.put_block_header(&header).expect("put");
        assert_eq!(hash, header.hash());

        assert_eq!(repo.hash_by_number(42).expect("lookup"), hash);
        assert_eq!(repo.number_by_hash(&hash).expect("lookup"), 42);
        assert_eq!(
            repo.get_block_header(&BlockId::Number(42)).expect("get"),
            header
        );
        assert_eq!(
            repo.get_block_header(&BlockId::Hash(hash)).expect("get"),
            header
        );
    }

    #[test]
    fn status_reflects_presence() {
        let repo = repo();
        let header = header(7);
        assert_eq!(
            repo.block_status(&BlockId::Number(7)).expect("status"),
            BlockStatus::Unknown
        );
        repo.put_block_header(&header).expect("put");
        assert_eq!(
            repo.block_status(&BlockId::Hash(header.hash()))
                .expect("status"),
            BlockStatus::InChain
        );
    }

    #[test]
    fn removal_clears_both_directions() {
        let repo = repo();
        let header = header(3);
        let hash = repo.put_block_header(&header).expect("put");
        repo.remove_block_header(&BlockId::Hash(hash)).expect("remove");
        assert!(matches!(
            repo.hash_by_number(3),
            Err(StoreError::BlockNotFound)
        ));
        assert!(matches!(
            repo.get_block_header(&BlockId::Hash(hash)),
            Err(StoreError::BlockNotFound)
        ));
    }

    #[test]
    fn missing_header_is_not_found() {
        let repo = repo();
        assert!(matches!(
            repo.get_block_header(&BlockId::Number(1)),
            Err(StoreError::BlockNotFound)
        ));
    }
}
