use bytes::{BufMut, Bytes};
use taskmesh_scale::{structs::Decoder, ScaleDecode, ScaleDecodeError, ScaleEncode};

/// Four-byte tag naming the consensus engine a digest item belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EngineId(pub [u8; 4]);

impl EngineId {
    pub const PRODUCTION: EngineId = EngineId(*b"PROD");
    pub const FINALITY: EngineId = EngineId(*b"FINL");
}

impl ScaleEncode for EngineId {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.0.encode(buf);
    }
}

impl ScaleDecode for EngineId {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (id, rest) = <[u8; 4]>::decode_unfinished(buf)?;
        Ok((Self(id), rest))
    }
}

/// Auxiliary per-block data attached by the authoring and finality engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestItem {
    Other(Bytes),
    PreRuntime(EngineId, Bytes),
    Verification(EngineId, Bytes),
    Seal(EngineId, Bytes),
}

impl ScaleEncode for DigestItem {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            DigestItem::Other(payload) => {
                buf.put_u8(0);
                payload.encode(buf);
            }
            DigestItem::PreRuntime(engine, payload) => {
                buf.put_u8(1);
                engine.encode(buf);
                payload.encode(buf);
            }
            DigestItem::Verification(engine, payload) => {
                buf.put_u8(2);
                engine.encode(buf);
                payload.encode(buf);
            }
            DigestItem::Seal(engine, payload) => {
                buf.put_u8(3);
                engine.encode(buf);
                payload.encode(buf);
            }
        }
    }
}

impl ScaleDecode for DigestItem {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
        let (tag, decoder) = Decoder::new(buf).decode_tag()?;
        match tag {
            0 => {
                let (payload, decoder) = decoder.decode_field("payload")?;
                Ok((DigestItem::Other(payload), decoder.finish()))
            }
            1 | 2 | 3 => {
                let (engine, decoder) = decoder.decode_field("engine")?;
                let (payload, decoder) = decoder.decode_field::<Bytes>("payload")?;
                let item = match tag {
                    1 => DigestItem::PreRuntime(engine, payload),
                    2 => DigestItem::Verification(engine, payload),
                    _ => DigestItem::Seal(engine, payload),
                };
                Ok((item, decoder.finish()))
            }
            other => Err(ScaleDecodeError::InvalidTag(other)),
        }
    }
}

pub type Digest = Vec<DigestItem>;
