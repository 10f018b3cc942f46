use bytes::BufMut;
use ethereum_types::{H160, U256};
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use taskmesh_common::Hasher;
use taskmesh_scale::{
    structs::{Decoder, Encoder},
    ScaleDecode, ScaleDecodeError, ScaleEncode,
};
use tracing::trace;

use crate::error::LedgerError;

/// An unspent output: a claim of `amount` tokens, addressed by the producing
/// transaction and output slot. `locked` marks outputs reserved by an
/// in-flight spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub txid_hash: U256,
    pub output_idx: u32,
    pub amount: u64,
    pub token_id: u8,
    pub locked: bool,
}

/// Reference to an output being spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRef {
    pub txid_hash: U256,
    pub output_idx: u32,
}

impl ScaleEncode for InputRef {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.txid_hash)
            .encode_field(&self.output_idx)
            .finish();
    }
}

impl ScaleDecode for InputRef {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (txid_hash, decoder) = decoder.decode_field("txid_hash")?;
        let (output_idx, decoder) = decoder.decode_field("output_idx")?;
        Ok((
            Self {
                txid_hash,
                output_idx,
            },
            decoder.finish(),
        ))
    }
}

/// A keyed account over a set of UTXOs. Balance is derived, never stored.
pub struct Account {
    secret: SecretKey,
    public: PublicKey,
    pub address: U256,
    pub token_id: u8,
    pub nonce: u64,
    pub utxos: Vec<Utxo>,
}

/// Ethereum-style address of a public key, widened to U256.
pub fn address_of(public: &PublicKey) -> U256 {
    let uncompressed = public.serialize_uncompressed();
    let digest = Hasher::keccak_256(&uncompressed[1..]);
    U256::from_big_endian(H160::from_slice(&digest.0[12..]).as_bytes())
}

impl Account {
    pub fn new(secret: SecretKey, token_id: u8) -> Self {
        let public = secret.public_key(SECP256K1);
        Self {
            secret,
            public,
            address: address_of(&public),
            token_id,
            nonce: 0,
            utxos: Vec::new(),
        }
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Sum of unlocked outputs of the queried token.
    pub fn balance(&self, token_id: u8) -> u64 {
        self.utxos
            .iter()
            .filter(|utxo| !utxo.locked && utxo.token_id == token_id)
            .map(|utxo| utxo.amount)
            .sum()
    }

    /// Adds an output unless the same `(txid, idx)` is already tracked.
    pub fn put_utxo(&mut self, new_utxo: Utxo) -> bool {
        let known = self.utxos.iter().any(|utxo| {
            utxo.txid_hash == new_utxo.txid_hash && utxo.output_idx == new_utxo.output_idx
        });
        if !known {
            trace!(amount = new_utxo.amount, "tracking new output");
            self.utxos.push(new_utxo);
        }
        !known
    }

    /// Drops every output named in `spent`.
    pub fn refresh_utxos(&mut self, spent: &[InputRef]) {
        self.utxos.retain(|utxo| {
            !spent.iter().any(|input| {
                input.txid_hash == utxo.txid_hash && input.output_idx == utxo.output_idx
            })
        });
    }

    /// Picks outputs covering `amount` in insertion order, locking each one.
    /// Returns the selection and the change; on insufficient funds nothing
    /// is locked.
    pub fn select_inputs(&mut self, amount: u64) -> Result<(Vec<InputRef>, u64), LedgerError> {
        let mut selected = Vec::new();
        let mut remain = i128::from(amount);
        let mut candidate_utxos = self.utxos.clone();
        for utxo in candidate_utxos.iter_mut() {
            if remain <= 0 {
                break;
            }
            if utxo.locked || utxo.token_id != self.token_id {
                continue;
            }
            remain -= i128::from(utxo.amount);
            utxo.locked = true;
            selected.push(InputRef {
                txid_hash: utxo.txid_hash,
                output_idx: utxo.output_idx,
            });
        }
        if remain > 0 {
            return Err(LedgerError::InsufficientFunds);
        }
        self.utxos = candidate_utxos;
        Ok((selected, remain.unsigned_abs() as u64))
    }

    /// Locks one output whose amount alone covers `amount`; escrow reserves
    /// exactly one.
    pub fn lock_single_covering(&mut self, amount: u64) -> Result<InputRef, LedgerError> {
        let utxo = self
            .utxos
            .iter_mut()
            .find(|utxo| !utxo.locked && utxo.token_id == self.token_id && utxo.amount >= amount)
            .ok_or(LedgerError::NoSuitableOutput)?;
        utxo.locked = true;
        Ok(InputRef {
            txid_hash: utxo.txid_hash,
            output_idx: utxo.output_idx,
        })
    }

    /// Reverts a selection, e.g. when a spend is abandoned.
    pub fn unlock(&mut self, inputs: &[InputRef]) {
        for utxo in self.utxos.iter_mut() {
            if inputs.iter().any(|input| {
                input.txid_hash == utxo.txid_hash && input.output_idx == utxo.output_idx
            }) {
                utxo.locked = false;
            }
        }
    }
}
