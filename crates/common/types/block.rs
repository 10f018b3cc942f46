use bytes::{BufMut, Bytes};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use taskmesh_scale::{
    structs::{Decoder, Encoder},
    Compact, ScaleDecode, ScaleDecodeError, ScaleEncode,
};

use crate::hasher::Hasher;
use crate::types::digest::Digest;

pub type BlockNumber = u64;

/// An opaque chain transaction as it travels in block bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extrinsic(pub Bytes);

impl Extrinsic {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn hash(&self) -> H256 {
        Hasher::blake2b_256(&self.0)
    }
}

impl ScaleEncode for Extrinsic {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.0.encode(buf);
    }
}

impl ScaleDecode for Extrinsic {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (data, rest) = Bytes::decode_unfinished(buf)?;
        Ok((Self(data), rest))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub number: BlockNumber,
    pub state_root: H256,
    pub extrinsics_root: H256,
    pub digest: Digest,
}

impl BlockHeader {
    /// Blake2b-256 over the header encoding; the chain-wide block identity.
    pub fn hash(&self) -> H256 {
        Hasher::blake2b_256(&self.encode_to_vec())
    }
}

impl ScaleEncode for BlockHeader {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.parent_hash)
            .encode_field(&Compact(self.number))
            .encode_field(&self.state_root)
            .encode_field(&self.extrinsics_root)
            .encode_field(&self.digest)
            .finish();
    }
}

impl ScaleDecode for BlockHeader {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (parent_hash, decoder) = decoder.decode_field("parent_hash")?;
        let (Compact(number), decoder) = decoder.decode_field("number")?;
        let (state_root, decoder) = decoder.decode_field("state_root")?;
        let (extrinsics_root, decoder) = decoder.decode_field("extrinsics_root")?;
        let (digest, decoder) = decoder.decode_field("digest")?;
        Ok((
            Self {
                parent_hash,
                number,
                state_root,
                extrinsics_root,
                digest,
            },
            decoder.finish(),
        ))
    }
}

pub type BlockBody = Vec<Extrinsic>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }
}

impl ScaleEncode for Block {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.header)
            .encode_field(&self.body)
            .finish();
    }
}

impl ScaleDecode for Block {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (header, decoder) = decoder.decode_field("header")?;
        let (body, decoder) = decoder.decode_field("body")?;
        Ok((Self { header, body }, decoder.finish()))
    }
}

/// A finality proof: the signed precommits that justify a finalized block,
/// kept opaque at this level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Justification(pub Bytes);

impl ScaleEncode for Justification {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.0.encode(buf);
    }
}

impl ScaleDecode for Justification {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (data, rest) = Bytes::decode_unfinished(buf)?;
        Ok((Self(data), rest))
    }
}

/// Everything known about a block, as exchanged in sync responses. Any field
/// but the hash may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockData {
    pub hash: H256,
    pub header: Option<BlockHeader>,
    pub body: Option<BlockBody>,
    pub receipt: Option<Bytes>,
    pub message_queue: Option<Bytes>,
    pub justification: Option<Justification>,
}

impl ScaleEncode for BlockData {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.hash)
            .encode_field(&self.header)
            .encode_field(&self.body)
            .encode_field(&self.receipt)
            .encode_field(&self.message_queue)
            .encode_field(&self.justification)
            .finish();
    }
}

impl ScaleDecode for BlockData {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (hash, decoder) = decoder.decode_field("hash")?;
        let (header, decoder) = decoder.decode_field("header")?;
        let (body, decoder) = decoder.decode_field("body")?;
        let (receipt, decoder) = decoder.decode_field("receipt")?;
        let (message_queue, decoder) = decoder.decode_field("message_queue")?;
        let (justification, decoder) = decoder.decode_field("justification")?;
        Ok((
            Self {
                hash,
                header,
                body,
                receipt,
                message_queue,
                justification,
            },
            decoder.finish(),
        ))
    }
}

/// Either side of the number/hash index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Number(BlockNumber),
    Hash(H256),
}

impl From<BlockNumber> for BlockId {
    fn from(number: BlockNumber) -> Self {
        Self::Number(number)
    }
}

impl From<H256> for BlockId {
    fn from(hash: H256) -> Self {
        Self::Hash(hash)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockInfo {
    pub number: BlockNumber,
    pub hash: H256,
}

impl BlockInfo {
    pub fn new(number: BlockNumber, hash: H256) -> Self {
        Self { number, hash }
    }
}

impl ScaleEncode for BlockInfo {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.hash)
            .encode_field(&self.number)
            .finish();
    }
}

impl ScaleDecode for BlockInfo {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (hash, decoder) = decoder.decode_field("hash")?;
        let (number, decoder) = decoder.decode_field("number")?;
        Ok((Self { number, hash }, decoder.finish()))
    }
}
