use bytes::Bytes;
use ethereum_types::{H160, H256, H512, U256};

use crate::{Compact, ScaleDecodeError};

pub trait ScaleDecode: Sized {
    /// Decodes a value off the front of `buf`, returning it together with
    /// the remaining bytes.
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError>;

    /// Decodes a value that is expected to consume the whole input.
    fn decode(buf: &[u8]) -> Result<Self, ScaleDecodeError> {
        let (value, rest) = Self::decode_unfinished(buf)?;
        if !rest.is_empty() {
            return Err(ScaleDecodeError::MalformedData);
        }
        Ok(value)
    }
}

fn take<const N: usize>(buf: &[u8]) -> Result<([u8; N], &[u8]), ScaleDecodeError> {
    if buf.len() < N {
        return Err(ScaleDecodeError::UnexpectedEof);
    }
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&buf[..N]);
    Ok((bytes, &buf[N..]))
}

fn take_slice(buf: &[u8], len: usize) -> Result<(&[u8], &[u8]), ScaleDecodeError> {
    if buf.len() < len {
        return Err(ScaleDecodeError::UnexpectedEof);
    }
    Ok(buf.split_at(len))
}

impl ScaleDecode for u8 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<1>(buf)?;
        Ok((bytes[0], rest))
    }
}

impl ScaleDecode for u16 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<2>(buf)?;
        Ok((u16::from_le_bytes(bytes), rest))
    }
}

impl ScaleDecode for u32 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<4>(buf)?;
        Ok((u32::from_le_bytes(bytes), rest))
    }
}

impl ScaleDecode for u64 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<8>(buf)?;
        Ok((u64::from_le_bytes(bytes), rest))
    }
}

impl ScaleDecode for u128 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<16>(buf)?;
        Ok((u128::from_le_bytes(bytes), rest))
    }
}

impl ScaleDecode for bool {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (byte, rest) = take::<1>(buf)?;
        match byte[0] {
            0 => Ok((false, rest)),
            1 => Ok((true, rest)),
            other => Err(ScaleDecodeError::InvalidBool(other)),
        }
    }
}

impl ScaleDecode for Compact {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (first, _) = take::<1>(buf)?;
        match first[0] & 0b11 {
            0b00 => {
                let (byte, rest) = take::<1>(buf)?;
                Ok((Compact(u64::from(byte[0] >> 2)), rest))
            }
            0b01 => {
                let (bytes, rest) = take::<2>(buf)?;
                Ok((Compact(u64::from(u16::from_le_bytes(bytes) >> 2)), rest))
            }
            0b10 => {
                let (bytes, rest) = take::<4>(buf)?;
                Ok((Compact(u64::from(u32::from_le_bytes(bytes) >> 2)), rest))
            }
            _ => {
                let len = usize::from(first[0] >> 2) + 4;
                if len > 8 {
                    return Err(ScaleDecodeError::InvalidCompact);
                }
                let (payload, rest) = take_slice(&buf[1..], len)?;
                let mut bytes = [0u8; 8];
                bytes[..len].copy_from_slice(payload);
                Ok((Compact(u64::from_le_bytes(bytes)), rest))
            }
        }
    }
}

impl<T: ScaleDecode> ScaleDecode for Vec<T> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (Compact(len), mut rest) = Compact::decode_unfinished(buf)?;
        let len = usize::try_from(len).map_err(|_| ScaleDecodeError::Overflow)?;
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let (item, next) = T::decode_unfinished(rest)?;
            items.push(item);
            rest = next;
        }
        Ok((items, rest))
    }
}

impl ScaleDecode for Bytes {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (Compact(len), rest) = Compact::decode_unfinished(buf)?;
        let len = usize::try_from(len).map_err(|_| ScaleDecodeError::Overflow)?;
        let (payload, rest) = take_slice(rest, len)?;
        Ok((Bytes::copy_from_slice(payload), rest))
    }
}

impl ScaleDecode for String {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (Compact(len), rest) = Compact::decode_unfinished(buf)?;
        let len = usize::try_from(len).map_err(|_| ScaleDecodeError::Overflow)?;
        let (payload, rest) = take_slice(rest, len)?;
        let text = String::from_utf8(payload.to_vec())
            .map_err(|_| ScaleDecodeError::InvalidUtf8)?;
        Ok((text, rest))
    }
}

impl<const N: usize> ScaleDecode for [u8; N] {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        take::<N>(buf)
    }
}

impl ScaleDecode for H160 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<20>(buf)?;
        Ok((H160(bytes), rest))
    }
}

impl ScaleDecode for H256 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<32>(buf)?;
        Ok((H256(bytes), rest))
    }
}

impl ScaleDecode for H512 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<64>(buf)?;
        Ok((H512(bytes), rest))
    }
}

impl ScaleDecode for U256 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (bytes, rest) = take::<32>(buf)?;
        Ok((U256::from_little_endian(&bytes), rest))
    }
}

impl<T: ScaleDecode> ScaleDecode for Option<T> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (tag, rest) = take::<1>(buf)?;
        match tag[0] {
            0 => Ok((None, rest)),
            1 => {
                let (value, rest) = T::decode_unfinished(rest)?;
                Ok((Some(value), rest))
            }
            other => Err(ScaleDecodeError::InvalidTag(other)),
        }
    }
}

impl ScaleDecode for () {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        Ok(((), buf))
    }
}

impl<A: ScaleDecode, B: ScaleDecode> ScaleDecode for (A, B) {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (a, rest) = A::decode_unfinished(buf)?;
        let (b, rest) = B::decode_unfinished(rest)?;
        Ok(((a, b), rest))
    }
}

impl<A: ScaleDecode, B: ScaleDecode, C: ScaleDecode> ScaleDecode for (A, B, C) {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (a, rest) = A::decode_unfinished(buf)?;
        let (b, rest) = B::decode_unfinished(rest)?;
        let (c, rest) = C::decode_unfinished(rest)?;
        Ok(((a, b, c), rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScaleEncode;

    #[test]
    fn compact_round_trip() {
        for value in [0u64, 1, 63, 64, 69, 16383, 16384, 1 << 30, u64::MAX] {
            let encoded = Compact(value).encode_to_vec();
            assert_eq!(Compact::decode(&encoded), Ok(Compact(value)));
        }
    }

    #[test]
    fn vec_round_trip() {
        let value: Vec<u32> = vec![1, 2, 0xdeadbeef];
        let encoded = value.encode_to_vec();
        assert_eq!(Vec::<u32>::decode(&encoded), Ok(value));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert_eq!(u8::decode(&[1, 2]), Err(ScaleDecodeError::MalformedData));
    }

    #[test]
    fn rejects_truncated_input() {
        assert_eq!(u32::decode(&[1, 2]), Err(ScaleDecodeError::UnexpectedEof));
        assert_eq!(
            Vec::<u8>::decode(&[0x0c, 1]),
            Err(ScaleDecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn rejects_bad_bool() {
        assert_eq!(bool::decode(&[2]), Err(ScaleDecodeError::InvalidBool(2)));
    }
}
