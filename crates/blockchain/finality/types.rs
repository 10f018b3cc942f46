use bytes::BufMut;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use taskmesh_common::{AuthorityId, AuthorityList, BlockInfo, Hasher};
use taskmesh_scale::{
    structs::{Decoder, Encoder},
    ScaleDecode, ScaleDecodeError, ScaleEncode,
};

use crate::error::FinalityError;

pub type RoundNumber = u64;
pub type SetId = u64;
pub type VoteWeight = u64;

/// A voter's identity is the Blake2b-256 of its compressed public key.
pub fn authority_id_of(public_key: &PublicKey) -> AuthorityId {
    AuthorityId(Hasher::blake2b_256(&public_key.serialize()).0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteStage {
    Prevote,
    Precommit,
}

impl VoteStage {
    pub fn as_u8(self) -> u8 {
        match self {
            VoteStage::Prevote => 0,
            VoteStage::Precommit => 1,
        }
    }
}

impl ScaleEncode for VoteStage {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(self.as_u8());
    }
}

impl ScaleDecode for VoteStage {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (tag, rest) = u8::decode_unfinished(buf)?;
        match tag {
            0 => Ok((VoteStage::Prevote, rest)),
            1 => Ok((VoteStage::Precommit, rest)),
            other => Err(ScaleDecodeError::InvalidTag(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    pub stage: VoteStage,
    pub target: BlockInfo,
}

impl ScaleEncode for Vote {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.stage)
            .encode_field(&self.target)
            .finish();
    }
}

impl ScaleDecode for Vote {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (stage, decoder) = decoder.decode_field("stage")?;
        let (target, decoder) = decoder.decode_field("target")?;
        Ok((Self { stage, target }, decoder.finish()))
    }
}

/// A vote bound to its round and voter set, signed with a recoverable
/// signature so the 32-byte authority id is enough to verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedVote {
    pub vote: Vote,
    pub round: RoundNumber,
    pub set_id: SetId,
    pub signature: Vec<u8>,
    pub id: AuthorityId,
}

impl SignedVote {
    pub fn sign(
        secret: &SecretKey,
        vote: Vote,
        round: RoundNumber,
        set_id: SetId,
    ) -> SignedVote {
        let digest = vote_digest(&vote, round, set_id);
        let message = Message::from_digest(digest);
        let signature = SECP256K1.sign_ecdsa_recoverable(&message, secret);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = compact.to_vec();
        bytes.push(recovery_id.to_i32() as u8);
        let id = authority_id_of(&secret.public_key(SECP256K1));
        SignedVote {
            vote,
            round,
            set_id,
            signature: bytes,
            id,
        }
    }

    /// Recovers the signer and checks it matches the claimed authority id.
    pub fn verify(&self) -> Result<(), FinalityError> {
        if self.signature.len() != 65 {
            return Err(FinalityError::BadSignature);
        }
        let recovery_id = RecoveryId::from_i32(i32::from(self.signature[64]))
            .map_err(|_| FinalityError::BadSignature)?;
        let signature = RecoverableSignature::from_compact(&self.signature[..64], recovery_id)
            .map_err(|_| FinalityError::BadSignature)?;
        let digest = vote_digest(&self.vote, self.round, self.set_id);
        let message = Message::from_digest(digest);
        let public_key = SECP256K1
            .recover_ecdsa(&message, &signature)
            .map_err(|_| FinalityError::BadSignature)?;
        if authority_id_of(&public_key) != self.id {
            return Err(FinalityError::BadSignature);
        }
        Ok(())
    }
}

fn vote_digest(vote: &Vote, round: RoundNumber, set_id: SetId) -> [u8; 32] {
    let mut payload = vote.encode_to_vec();
    round.encode(&mut payload);
    set_id.encode(&mut payload);
    Hasher::blake2b_256(&payload).0
}

impl ScaleEncode for SignedVote {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.vote)
            .encode_field(&self.round)
            .encode_field(&self.set_id)
            .encode_field(&self.signature)
            .encode_field(&self.id)
            .finish();
    }
}

impl ScaleDecode for SignedVote {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (vote, decoder) = decoder.decode_field("vote")?;
        let (round, decoder) = decoder.decode_field("round")?;
        let (set_id, decoder) = decoder.decode_field("set_id")?;
        let (signature, decoder) = decoder.decode_field("signature")?;
        let (id, decoder) = decoder.decode_field("id")?;
        Ok((
            Self {
                vote,
                round,
                set_id,
                signature,
                id,
            },
            decoder.finish(),
        ))
    }
}

/// The ordered voter set of one membership era.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoterSet {
    pub set_id: SetId,
    pub authorities: AuthorityList,
}

impl VoterSet {
    pub fn new(set_id: SetId, authorities: AuthorityList) -> Self {
        Self { set_id, authorities }
    }

    pub fn total_weight(&self) -> VoteWeight {
        self.authorities.total_weight()
    }

    pub fn weight_of(&self, id: &AuthorityId) -> Option<VoteWeight> {
        self.authorities
            .iter()
            .find(|authority| authority.id == *id)
            .map(|authority| authority.weight)
    }

    pub fn contains(&self, id: &AuthorityId) -> bool {
        self.weight_of(id).is_some()
    }

    /// 2/3-supermajority by weight.
    pub fn is_supermajority(&self, weight: VoteWeight) -> bool {
        weight * 3 >= self.total_weight() * 2
    }
}

/// Proof that a block is final: the supermajority of precommits of one
/// round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalityJustification {
    pub round: RoundNumber,
    pub block: BlockInfo,
    pub precommits: Vec<SignedVote>,
}

impl FinalityJustification {
    /// Checks every signature and that the distinct precommits carry
    /// supermajority weight for the justified block.
    pub fn verify(&self, voters: &VoterSet) -> Result<(), FinalityError> {
        let mut seen = std::collections::HashSet::new();
        let mut weight: VoteWeight = 0;
        for precommit in &self.precommits {
            if precommit.vote.stage != VoteStage::Precommit
                || precommit.round != self.round
                || precommit.vote.target.hash != self.block.hash
            {
                return Err(FinalityError::UnknownBlock);
            }
            precommit.verify()?;
            let voter_weight = voters
                .weight_of(&precommit.id)
                .ok_or(FinalityError::UnknownVoter)?;
            if seen.insert(precommit.id) {
                weight += voter_weight;
            }
        }
        if !voters.is_supermajority(weight) {
            return Err(FinalityError::InsufficientWeight);
        }
        Ok(())
    }
}

impl ScaleEncode for FinalityJustification {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.round)
            .encode_field(&self.block)
            .encode_field(&self.precommits)
            .finish();
    }
}

impl ScaleDecode for FinalityJustification {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (round, decoder) = decoder.decode_field("round")?;
        let (block, decoder) = decoder.decode_field("block")?;
        let (precommits, decoder) = decoder.decode_field("precommits")?;
        Ok((
            Self {
                round,
                block,
                precommits,
            },
            decoder.finish(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;
    use taskmesh_common::Authority;

    fn secret(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).expect("valid key")
    }

    fn voters(secrets: &[&SecretKey]) -> VoterSet {
        VoterSet::new(
            1,
            secrets
                .iter()
                .map(|secret| Authority {
                    id: authority_id_of(&secret.public_key(SECP256K1)),
                    weight: 1,
                })
                .collect(),
        )
    }

    fn vote(stage: VoteStage) -> Vote {
        Vote {
            stage,
            target: BlockInfo::new(3, H256::repeat_byte(3)),
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let secret = secret(1);
        let signed = SignedVote::sign(&secret, vote(VoteStage::Prevote), 7, 1);
        signed.verify().expect("valid signature");

        let mut tampered = signed.clone();
        tampered.vote.target.number = 4;
        assert!(matches!(tampered.verify(), Err(FinalityError::BadSignature)));

        let mut wrong_claim = signed;
        wrong_claim.id = AuthorityId([9; 32]);
        assert!(matches!(
            wrong_claim.verify(),
            Err(FinalityError::BadSignature)
        ));
    }

    #[test]
    fn signed_vote_scale_round_trip() {
        let signed = SignedVote::sign(&secret(2), vote(VoteStage::Precommit), 1, 5);
        let encoded = signed.encode_to_vec();
        assert_eq!(SignedVote::decode(&encoded), Ok(signed));
    }

    #[test]
    fn supermajority_threshold() {
        let secrets = [secret(1), secret(2), secret(3)];
        let voters = voters(&[&secrets[0], &secrets[1], &secrets[2]]);
        assert!(!voters.is_supermajority(1));
        assert!(voters.is_supermajority(2));
        assert!(voters.is_supermajority(3));
    }

    #[test]
    fn justification_verification() {
        let secrets = [secret(1), secret(2), secret(3)];
        let voters = voters(&[&secrets[0], &secrets[1], &secrets[2]]);
        let target = vote(VoteStage::Precommit);

        let precommits: Vec<SignedVote> = secrets
            .iter()
            .take(2)
            .map(|secret| SignedVote::sign(secret, target, 7, 1))
            .collect();
        let justification = FinalityJustification {
            round: 7,
            block: target.target,
            precommits,
        };
        justification.verify(&voters).expect("enough weight");

        let thin = FinalityJustification {
            precommits: justification.precommits[..1].to_vec(),
            ..justification.clone()
        };
        assert!(matches!(
            thin.verify(&voters),
            Err(FinalityError::InsufficientWeight)
        ));

        // an outsider's precommit invalidates the proof
        let outsider = SignedVote::sign(&secret(9), target, 7, 1);
        let mut poisoned = justification;
        poisoned.precommits.push(outsider);
        assert!(matches!(
            poisoned.verify(&voters),
            Err(FinalityError::UnknownVoter)
        ));
    }

    #[test]
    fn justification_scale_round_trip() {
        let secret = secret(4);
        let target = vote(VoteStage::Precommit);
        let justification = FinalityJustification {
            round: 2,
            block: target.target,
            precommits: vec![SignedVote::sign(&secret, target, 2, 1)],
        };
        let encoded = justification.encode_to_vec();
        assert_eq!(FinalityJustification::decode(&encoded), Ok(justification));
    }
}
