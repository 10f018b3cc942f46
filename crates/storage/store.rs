use ethereum_types::H256;
use std::sync::Arc;
use taskmesh_common::{
    AuthorityList, Block, BlockBody, BlockData, BlockHeader, BlockId, BlockNumber, Justification,
};
use taskmesh_scale::{ScaleDecode, ScaleEncode};
use taskmesh_trie::EMPTY_TRIE_ROOT;
use tracing::info;

use crate::api::KvStore;
use crate::error::StoreError;
use crate::headers::BlockHeaderRepository;

const BODY_PREFIX: &[u8] = b"blockchain/b/";
const JUSTIFICATION_PREFIX: &[u8] = b"blockchain/j/";
const LAST_FINALIZED_KEY: &[u8] = b"blockchain/lf";
const AUTHORITY_SET_KEY: &[u8] = b":authset";

/// Full-block CRUD over the KV store, plus genesis seeding and the
/// last-finalized pointer.
///
/// Blocks are written once and never mutated; only the last-finalized pointer
/// advances. Removal happens when abandoned forks are pruned.
pub struct BlockStorage {
    db: Arc<dyn KvStore>,
    headers: Arc<BlockHeaderRepository>,
}

impl BlockStorage {
    /// Opens storage that already holds a chain. The last-finalized pointer
    /// must resolve to a stored header.
    pub fn load_existing(
        db: Arc<dyn KvStore>,
        headers: Arc<BlockHeaderRepository>,
    ) -> Result<Self, StoreError> {
        let storage = Self { db, headers };
        let last = storage.last_finalized_block_hash()?;
        storage
            .headers
            .get_block_header(&BlockId::Hash(last))
            .map_err(|_| StoreError::FinalizedBlockNotFound)?;
        Ok(storage)
    }

    /// Seeds an empty store with a genesis block built from the supplied
    /// state root and authority set, and points last-finalized at it.
    pub fn create_with_genesis(
        state_root: H256,
        authorities: &AuthorityList,
        db: Arc<dyn KvStore>,
        headers: Arc<BlockHeaderRepository>,
    ) -> Result<Self, StoreError> {
        let storage = Self { db, headers };
        storage.ensure_genesis_not_exists()?;

        storage
            .db
            .put(AUTHORITY_SET_KEY, &authorities.encode_to_vec())?;

        let genesis = Block {
            header: BlockHeader {
                parent_hash: H256::zero(),
                number: 0,
                state_root,
                extrinsics_root: *EMPTY_TRIE_ROOT,
                digest: vec![],
            },
            body: vec![],
        };
        let hash = storage.put_block(&genesis)?;
        storage.set_last_finalized_block_hash(&hash)?;
        info!(genesis = %hash, "seeded chain storage");
        Ok(storage)
    }

    pub fn genesis_block_hash(&self) -> Result<H256, StoreError> {
        self.headers
            .hash_by_number(0)
            .map_err(|_| StoreError::GenesisBlockNotFound)
    }

    pub fn last_finalized_block_hash(&self) -> Result<H256, StoreError> {
        let raw = self
            .db
            .get(LAST_FINALIZED_KEY)?
            .ok_or(StoreError::FinalizedBlockNotFound)?;
        if raw.len() != 32 {
            return Err(StoreError::FinalizedBlockNotFound);
        }
        Ok(H256::from_slice(&raw))
    }

    pub fn set_last_finalized_block_hash(&self, hash: &H256) -> Result<(), StoreError> {
        self.db.put(LAST_FINALIZED_KEY, hash.as_bytes())
    }

    pub fn authority_set(&self) -> Result<AuthorityList, StoreError> {
        let raw = self
            .db
            .get(AUTHORITY_SET_KEY)?
            .ok_or(StoreError::GenesisBlockNotFound)?;
        Ok(AuthorityList::decode(&raw)?)
    }

    pub fn header_repository(&self) -> &Arc<BlockHeaderRepository> {
        &self.headers
    }

    pub fn get_block_header(&self, id: &BlockId) -> Result<BlockHeader, StoreError> {
        self.headers.get_block_header(id)
    }

    pub fn get_block_body(&self, id: &BlockId) -> Result<BlockBody, StoreError> {
        let hash = self.resolve_hash(id)?;
        let raw = self
            .db
            .get(&body_key(&hash))?
            .ok_or(StoreError::BodyDoesNotExist)?;
        Ok(BlockBody::decode(&raw)?)
    }

    pub fn get_justification(&self, id: &BlockId) -> Result<Justification, StoreError> {
        let hash = self.resolve_hash(id)?;
        let raw = self
            .db
            .get(&justification_key(&hash))?
            .ok_or(StoreError::JustificationDoesNotExist)?;
        Ok(Justification::decode(&raw)?)
    }

    pub fn get_block_data(&self, id: &BlockId) -> Result<BlockData, StoreError> {
        let header = self.get_block_header(id)?;
        let hash = header.hash();
        Ok(BlockData {
            hash,
            body: self.get_block_body(&BlockId::Hash(hash)).ok(),
            justification: self.get_justification(&BlockId::Hash(hash)).ok(),
            header: Some(header),
            receipt: None,
            message_queue: None,
        })
    }

    pub fn put_block_header(&self, header: &BlockHeader) -> Result<H256, StoreError> {
        self.headers.put_block_header(header)
    }

    pub fn put_block_body(
        &self,
        _number: BlockNumber,
        hash: &H256,
        body: &BlockBody,
    ) -> Result<(), StoreError> {
        self.db.put(&body_key(hash), &body.encode_to_vec())
    }

    pub fn put_justification(
        &self,
        justification: &Justification,
        hash: &H256,
        _number: BlockNumber,
    ) -> Result<(), StoreError> {
        self.db
            .put(&justification_key(hash), &justification.encode_to_vec())
    }

    /// Writes header and body; fails without touching the store when the
    /// block is already present.
    pub fn put_block(&self, block: &Block) -> Result<H256, StoreError> {
        let hash = block.header.hash();
        if self
            .headers
            .get_block_header(&BlockId::Hash(hash))
            .is_ok()
        {
            return Err(StoreError::BlockExists);
        }
        self.headers.put_block_header(&block.header)?;
        self.put_block_body(block.header.number, &hash, &block.body)?;
        Ok(hash)
    }

    pub fn remove_block(&self, hash: &H256, _number: BlockNumber) -> Result<(), StoreError> {
        self.db.remove(&body_key(hash))?;
        self.db.remove(&justification_key(hash))?;
        self.headers.remove_block_header(&BlockId::Hash(*hash))
    }

    fn resolve_hash(&self, id: &BlockId) -> Result<H256, StoreError> {
        match id {
            BlockId::Hash(hash) => Ok(*hash),
            BlockId::Number(number) => self.headers.hash_by_number(*number),
        }
    }

    fn ensure_genesis_not_exists(&self) -> Result<(), StoreError> {
        match self.last_finalized_block_hash() {
            Ok(_) => Err(StoreError::GenesisBlockAlreadyExists),
            Err(StoreError::FinalizedBlockNotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn body_key(hash: &H256) -> Vec<u8> {
    [BODY_PREFIX, hash.as_bytes()].concat()
}

fn justification_key(hash: &H256) -> Vec<u8> {
    [JUSTIFICATION_PREFIX, hash.as_bytes()].concat()
}
