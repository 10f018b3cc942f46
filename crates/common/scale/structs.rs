use bytes::BufMut;

use crate::{decode::ScaleDecode, encode::ScaleEncode, error::ScaleDecodeError};

/// # Struct decoding helper
///
/// Decodes a struct field by field, in declaration order. Each field failure
/// is reported with the field's name.
///
/// ```
/// # use taskmesh_scale::structs::Decoder;
/// # use taskmesh_scale::error::ScaleDecodeError;
/// # use taskmesh_scale::decode::ScaleDecode;
/// #[derive(Debug, PartialEq, Eq)]
/// struct Simple {
///     pub a: u8,
///     pub b: u16,
/// }
///
/// impl ScaleDecode for Simple {
///     fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), ScaleDecodeError> {
///         let decoder = Decoder::new(buf);
///         let (a, decoder) = decoder.decode_field("a")?;
///         let (b, decoder) = decoder.decode_field("b")?;
///         Ok((Simple { a, b }, decoder.finish()))
///     }
/// }
///
/// let bytes = [61, 75, 0];
/// let decoded = Simple::decode(&bytes).unwrap();
/// assert_eq!(decoded, Simple { a: 61, b: 75 });
/// ```
#[derive(Debug)]
pub struct Decoder<'a> {
    payload: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { payload: buf }
    }

    pub fn decode_field<T: ScaleDecode>(
        self,
        name: &str,
    ) -> Result<(T, Self), ScaleDecodeError> {
        let (field, rest) = <T as ScaleDecode>::decode_unfinished(self.payload)
            .map_err(|err| field_decode_error::<T>(name, err))?;
        Ok((field, Self { payload: rest }))
    }

    /// Reads a raw enum tag byte without interpreting it.
    pub fn decode_tag(self) -> Result<(u8, Self), ScaleDecodeError> {
        let (tag, rest) = u8::decode_unfinished(self.payload)?;
        Ok((tag, Self { payload: rest }))
    }

    /// Returns the bytes remaining after the decoded fields.
    pub const fn finish(self) -> &'a [u8] {
        self.payload
    }

    pub const fn is_done(&self) -> bool {
        self.payload.is_empty()
    }
}

fn field_decode_error<T>(field_name: &str, err: ScaleDecodeError) -> ScaleDecodeError {
    let typ = std::any::type_name::<T>();
    ScaleDecodeError::Custom(format!(
        "Error decoding field '{field_name}' of type {typ}: {err}"
    ))
}

/// # Struct encoding helper
///
/// Appends each field's encoding in the order they are passed.
///
/// ```
/// # use taskmesh_scale::structs::Encoder;
/// # use taskmesh_scale::encode::ScaleEncode;
/// # use bytes::BufMut;
/// struct Simple {
///     pub a: u8,
///     pub b: u16,
/// }
///
/// impl ScaleEncode for Simple {
///     fn encode(&self, buf: &mut dyn BufMut) {
///         Encoder::new(buf)
///             .encode_field(&self.a)
///             .encode_field(&self.b)
///             .finish();
///     }
/// }
///
/// let mut buf = vec![];
/// Simple { a: 61, b: 75 }.encode(&mut buf);
/// assert_eq!(&buf, &[61, 75, 0]);
/// ```
#[must_use = "`Encoder` must be consumed with `finish` to perform the encoding"]
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
}

impl core::fmt::Debug for Encoder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Encoder").field("buf", &"...").finish()
    }
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self { buf }
    }

    pub fn encode_field<T: ScaleEncode>(self, value: &T) -> Self {
        <T as ScaleEncode>::encode(value, self.buf);
        self
    }

    /// Writes a raw enum tag byte.
    pub fn encode_tag(self, tag: u8) -> Self {
        self.buf.put_u8(tag);
        self
    }

    /// Adds raw bytes without a length prefix.
    pub fn encode_raw(self, value: &[u8]) -> Self {
        self.buf.put_slice(value);
        self
    }

    pub fn finish(self) {}
}
