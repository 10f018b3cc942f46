use bytes::BufMut;
use ethereum_types::{H256, U256};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, SecretKey, SECP256K1};
use taskmesh_common::Hasher;
use taskmesh_scale::{
    structs::{Decoder, Encoder},
    ScaleDecode, ScaleDecodeError, ScaleEncode,
};

use crate::account::{address_of, InputRef};
use crate::error::LedgerError;

/// Transaction kind; doubles as the first byte of the encoding so block
/// parsers can dispatch without decoding the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Transfer,
    Mint,
    Escrow,
    ProcessingPayout,
}

impl TxKind {
    pub fn as_u8(self) -> u8 {
        match self {
            TxKind::Transfer => 0,
            TxKind::Mint => 1,
            TxKind::Escrow => 2,
            TxKind::ProcessingPayout => 3,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(TxKind::Transfer),
            1 => Some(TxKind::Mint),
            2 => Some(TxKind::Escrow),
            3 => Some(TxKind::ProcessingPayout),
            _ => None,
        }
    }
}

/// Ties a transaction to its issuer and its predecessor in the issuer's
/// transaction DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagHeader {
    pub data_hash: H256,
    pub prev_hash: H256,
    pub source: U256,
    pub nonce: u64,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

impl ScaleEncode for DagHeader {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.data_hash)
            .encode_field(&self.prev_hash)
            .encode_field(&self.source)
            .encode_field(&self.nonce)
            .encode_field(&self.timestamp)
            .encode_field(&self.signature)
            .finish();
    }
}

impl ScaleDecode for DagHeader {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (data_hash, decoder) = decoder.decode_field("data_hash")?;
        let (prev_hash, decoder) = decoder.decode_field("prev_hash")?;
        let (source, decoder) = decoder.decode_field("source")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (timestamp, decoder) = decoder.decode_field("timestamp")?;
        let (signature, decoder) = decoder.decode_field("signature")?;
        Ok((
            Self {
                data_hash,
                prev_hash,
                source,
                nonce,
                timestamp,
                signature,
            },
            decoder.finish(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDest {
    pub dest: U256,
    pub amount: u64,
}

impl ScaleEncode for OutputDest {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.dest)
            .encode_field(&self.amount)
            .finish();
    }
}

impl ScaleDecode for OutputDest {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (dest, decoder) = decoder.decode_field("dest")?;
        let (amount, decoder) = decoder.decode_field("amount")?;
        Ok((Self { dest, amount }, decoder.finish()))
    }
}

/// Chain transaction in one of the ledger's four shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Transfer {
        header: DagHeader,
        token_id: u8,
        inputs: Vec<InputRef>,
        outputs: Vec<OutputDest>,
    },
    Mint {
        header: DagHeader,
        token_id: u8,
        amount: u64,
    },
    Escrow {
        header: DagHeader,
        token_id: u8,
        amount: u64,
        num_chunks: u64,
        original_input: InputRef,
        job_hash: H256,
    },
    ProcessingPayout {
        header: DagHeader,
        token_id: u8,
        input: InputRef,
        outputs: Vec<OutputDest>,
        job_hash: H256,
    },
}

impl Transaction {
    pub fn kind(&self) -> TxKind {
        match self {
            Transaction::Transfer { .. } => TxKind::Transfer,
            Transaction::Mint { .. } => TxKind::Mint,
            Transaction::Escrow { .. } => TxKind::Escrow,
            Transaction::ProcessingPayout { .. } => TxKind::ProcessingPayout,
        }
    }

    pub fn header(&self) -> &DagHeader {
        match self {
            Transaction::Transfer { header, .. }
            | Transaction::Mint { header, .. }
            | Transaction::Escrow { header, .. }
            | Transaction::ProcessingPayout { header, .. } => header,
        }
    }

    fn header_mut(&mut self) -> &mut DagHeader {
        match self {
            Transaction::Transfer { header, .. }
            | Transaction::Mint { header, .. }
            | Transaction::Escrow { header, .. }
            | Transaction::ProcessingPayout { header, .. } => header,
        }
    }

    /// Identifier the produced outputs are addressed by.
    pub fn txid(&self) -> U256 {
        U256::from_big_endian(Hasher::blake2b_256(&self.encode_to_vec()).as_bytes())
    }

    /// Signs over the encoding with an empty signature slot and fills the
    /// slot with the recoverable signature.
    pub fn sign(&mut self, secret: &SecretKey) {
        self.header_mut().signature = Vec::new();
        let digest = Hasher::blake2b_256(&self.encode_to_vec()).0;
        let message = Message::from_digest(digest);
        let signature = SECP256K1.sign_ecdsa_recoverable(&message, secret);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = compact.to_vec();
        bytes.push(recovery_id.to_i32() as u8);
        self.header_mut().signature = bytes;
    }

    /// Recovers the signer and checks it is the claimed source address.
    pub fn verify(&self) -> Result<(), LedgerError> {
        let signature = self.header().signature.clone();
        if signature.len() != 65 {
            return Err(LedgerError::BadSignature);
        }
        let mut unsigned = self.clone();
        unsigned.header_mut().signature = Vec::new();
        let digest = Hasher::blake2b_256(&unsigned.encode_to_vec()).0;
        let message = Message::from_digest(digest);
        let recovery_id = RecoveryId::from_i32(i32::from(signature[64]))
            .map_err(|_| LedgerError::BadSignature)?;
        let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
            .map_err(|_| LedgerError::BadSignature)?;
        let public = SECP256K1
            .recover_ecdsa(&message, &recoverable)
            .map_err(|_| LedgerError::BadSignature)?;
        if address_of(&public) != self.header().source {
            return Err(LedgerError::BadSignature);
        }
        Ok(())
    }
}

impl ScaleEncode for Transaction {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(self.kind().as_u8());
        match self {
            Transaction::Transfer {
                header,
                token_id,
                inputs,
                outputs,
            } => {
                Encoder::new(buf)
                    .encode_field(header)
                    .encode_field(token_id)
                    .encode_field(inputs)
                    .encode_field(outputs)
                    .finish();
            }
            Transaction::Mint {
                header,
                token_id,
                amount,
            } => {
                Encoder::new(buf)
                    .encode_field(header)
                    .encode_field(token_id)
                    .encode_field(amount)
                    .finish();
            }
            Transaction::Escrow {
                header,
                token_id,
                amount,
                num_chunks,
                original_input,
                job_hash,
            } => {
                Encoder::new(buf)
                    .encode_field(header)
                    .encode_field(token_id)
                    .encode_field(amount)
                    .encode_field(num_chunks)
                    .encode_field(original_input)
                    .encode_field(job_hash)
                    .finish();
            }
            Transaction::ProcessingPayout {
                header,
                token_id,
                input,
                outputs,
                job_hash,
            } => {
                Encoder::new(buf)
                    .encode_field(header)
                    .encode_field(token_id)
                    .encode_field(input)
                    .encode_field(outputs)
                    .encode_field(job_hash)
                    .finish();
            }
        }
    }
}

impl ScaleDecode for Transaction {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (tag, decoder) = Decoder::new(buf).decode_tag()?;
        match TxKind::from_u8(tag) {
            Some(TxKind::Transfer) => {
                let (header, decoder) = decoder.decode_field("header")?;
                let (token_id, decoder) = decoder.decode_field("token_id")?;
                let (inputs, decoder) = decoder.decode_field("inputs")?;
                let (outputs, decoder) = decoder.decode_field("outputs")?;
                Ok((
                    Transaction::Transfer {
                        header,
                        token_id,
                        inputs,
                        outputs,
                    },
                    decoder.finish(),
                ))
            }
            Some(TxKind::Mint) => {
                let (header, decoder) = decoder.decode_field("header")?;
                let (token_id, decoder) = decoder.decode_field("token_id")?;
                let (amount, decoder) = decoder.decode_field("amount")?;
                Ok((
                    Transaction::Mint {
                        header,
                        token_id,
                        amount,
                    },
                    decoder.finish(),
                ))
            }
            Some(TxKind::Escrow) => {
                let (header, decoder) = decoder.decode_field("header")?;
                let (token_id, decoder) = decoder.decode_field("token_id")?;
                let (amount, decoder) = decoder.decode_field("amount")?;
                let (num_chunks, decoder) = decoder.decode_field("num_chunks")?;
                let (original_input, decoder) = decoder.decode_field("original_input")?;
                let (job_hash, decoder) = decoder.decode_field("job_hash")?;
                Ok((
                    Transaction::Escrow {
                        header,
                        token_id,
                        amount,
                        num_chunks,
                        original_input,
                        job_hash,
                    },
                    decoder.finish(),
                ))
            }
            Some(TxKind::ProcessingPayout) => {
                let (header, decoder) = decoder.decode_field("header")?;
                let (token_id, decoder) = decoder.decode_field("token_id")?;
                let (input, decoder) = decoder.decode_field("input")?;
                let (outputs, decoder) = decoder.decode_field("outputs")?;
                let (job_hash, decoder) = decoder.decode_field("job_hash")?;
                Ok((
                    Transaction::ProcessingPayout {
                        header,
                        token_id,
                        input,
                        outputs,
                        job_hash,
                    },
                    decoder.finish(),
                ))
            }
            None => Err(ScaleDecodeError::InvalidTag(tag)),
        }
    }
}
