use bytes::BufMut;
use serde::{Deserialize, Serialize};
use taskmesh_scale::{
    structs::{Decoder, Encoder},
    ScaleDecode, ScaleDecodeError, ScaleEncode,
};

use crate::types::block::BlockNumber;

/// 32-byte public key of a voter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AuthorityId(pub [u8; 32]);

impl ScaleEncode for AuthorityId {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.0.encode(buf);
    }
}

impl ScaleDecode for AuthorityId {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (id, rest) = <[u8; 32]>::decode_unfinished(buf)?;
        Ok((Self(id), rest))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub id: AuthorityId,
    pub weight: u64,
}

impl ScaleEncode for Authority {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.id)
            .encode_field(&self.weight)
            .finish();
    }
}

impl ScaleDecode for Authority {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let decoder = Decoder::new(buf);
        let (id, decoder) = decoder.decode_field("id")?;
        let (weight, decoder) = decoder.decode_field("weight")?;
        Ok((Self { id, weight }, decoder.finish()))
    }
}

/// Ordered voter set; the encoding preserves the order, which is part of the
/// set's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityList(pub Vec<Authority>);

impl AuthorityList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Authority> {
        self.0.iter()
    }

    pub fn total_weight(&self) -> u64 {
        self.0.iter().map(|a| a.weight).sum()
    }
}

impl std::ops::Index<usize> for AuthorityList {
    type Output = Authority;

    fn index(&self, index: usize) -> &Authority {
        &self.0[index]
    }
}

impl FromIterator<Authority> for AuthorityList {
    fn from_iter<I: IntoIterator<Item = Authority>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl ScaleEncode for AuthorityList {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.0.encode(buf);
    }
}

impl ScaleDecode for AuthorityList {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (list, rest) = Vec::<Authority>::decode_unfinished(buf)?;
        Ok((Self(list), rest))
    }
}

/// Authority-set transition announced in a block's verification digest.
///
/// Tag values start at 1: tag 0 is reserved so a zeroed payload never parses
/// as a valid transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationDigest {
    ScheduledChange {
        authorities: AuthorityList,
        delay: BlockNumber,
    },
    ForcedChange {
        authorities: AuthorityList,
        delay: BlockNumber,
    },
    OnDisabled {
        authority_index: u64,
    },
    Pause {
        delay: BlockNumber,
    },
    Resume {
        delay: BlockNumber,
    },
}

impl ScaleEncode for VerificationDigest {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            VerificationDigest::ScheduledChange { authorities, delay } => {
                buf.put_u8(1);
                authorities.encode(buf);
                delay.encode(buf);
            }
            VerificationDigest::ForcedChange { authorities, delay } => {
                buf.put_u8(2);
                authorities.encode(buf);
                delay.encode(buf);
            }
            VerificationDigest::OnDisabled { authority_index } => {
                buf.put_u8(3);
                authority_index.encode(buf);
            }
            VerificationDigest::Pause { delay } => {
                buf.put_u8(4);
                delay.encode(buf);
            }
            VerificationDigest::Resume { delay } => {
                buf.put_u8(5);
                delay.encode(buf);
            }
        }
    }
}

impl ScaleDecode for VerificationDigest {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (tag, decoder) = Decoder::new(buf).decode_tag()?;
        match tag {
            1 | 2 => {
                let (authorities, decoder) = decoder.decode_field("authorities")?;
                let (delay, decoder) = decoder.decode_field("delay")?;
                let digest = if tag == 1 {
                    VerificationDigest::ScheduledChange { authorities, delay }
                } else {
                    VerificationDigest::ForcedChange { authorities, delay }
                };
                Ok((digest, decoder.finish()))
            }
            3 => {
                let (authority_index, decoder) = decoder.decode_field("authority_index")?;
                Ok((
                    VerificationDigest::OnDisabled { authority_index },
                    decoder.finish(),
                ))
            }
            4 => {
                let (delay, decoder) = decoder.decode_field("delay")?;
                Ok((VerificationDigest::Pause { delay }, decoder.finish()))
            }
            5 => {
                let (delay, decoder) = decoder.decode_field("delay")?;
                Ok((VerificationDigest::Resume { delay }, decoder.finish()))
            }
            other => Err(ScaleDecodeError::InvalidTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_list() -> AuthorityList {
        AuthorityList(vec![
            Authority {
                id: AuthorityId([2; 32]),
                weight: 1,
            },
            Authority {
                id: AuthorityId([3; 32]),
                weight: 2,
            },
        ])
    }

    #[test]
    fn list_encoding_is_order_sensitive() {
        let list = sample_list();
        let mut reversed = list.clone();
        reversed.0.reverse();
        assert_ne!(list.encode_to_vec(), reversed.encode_to_vec());
    }

    #[test]
    fn verification_digest_round_trip() {
        for digest in [
            VerificationDigest::ScheduledChange {
                authorities: sample_list(),
                delay: 4,
            },
            VerificationDigest::ForcedChange {
                authorities: sample_list(),
                delay: 0,
            },
            VerificationDigest::OnDisabled { authority_index: 1 },
            VerificationDigest::Pause { delay: 10 },
            VerificationDigest::Resume { delay: 10 },
        ] {
            let encoded = digest.encode_to_vec();
            assert_eq!(VerificationDigest::decode(&encoded), Ok(digest));
        }
    }

    #[test]
    fn total_weight_sums_members() {
        assert_eq!(sample_list().total_weight(), 3);
    }
}
