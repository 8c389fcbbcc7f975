use crate::cancellation::{deadline_from_millis, deadline_to_millis};
use crate::errors::CodecError;
use crate::metadata::{Metadata, MetadataValue};
use crate::status::{Code, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;
use std::time::SystemTime;

/// Length of short (u16) length fields.
pub const SHORT_LEN_LEN: usize = 2;
/// Length of long (u32) length fields.
pub const LONG_LEN_LEN: usize = 4;

const METADATA_ASCII: u8 = 0x0;
const METADATA_BINARY: u8 = 0x1;

/// Typed wire unit.
pub trait Codec: Sized {
    fn encode(self, dst: &mut BytesMut) -> Result<(), CodecError>;
    fn decode(src: &mut Bytes) -> Result<Self, CodecError>;

    fn encode_bytes(self) -> Result<Bytes, CodecError> {
        let mut bytes = BytesMut::new();
        self.encode(&mut bytes)?;
        Ok(bytes.freeze())
    }
}

bitflags! {
    pub struct StatusFlags: u8 {
        const NONE = 0x00;
        const HAS_TRAILERS = 0x01;
    }
}

/// First unit of every call, sent once by the client.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters, new)]
pub struct RequestEnvelope {
    #[get = "pub"]
    /// method~2
    method_name: String,
    #[get = "pub"]
    /// nh:2 (hk~2 tag:1 hv~4){nh}
    headers: Metadata,
    #[getset(get_copy = "pub")]
    /// deadline:8 (unix millis, 0 for none)
    deadline: Option<SystemTime>,
}

impl Codec for RequestEnvelope {
    fn encode(self, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_short_string(&self.method_name, dst)?;
        self.headers.encode(dst)?;
        dst.put_u64(deadline_to_millis(self.deadline));
        Ok(())
    }

    fn decode(src: &mut Bytes) -> Result<Self, CodecError> {
        let method_name = decode_short_string(src)?;
        let headers = Metadata::decode(src)?;
        ensure_remaining(src, 8, "deadline")?;
        let deadline = deadline_from_millis(src.get_u64());
        Ok(RequestEnvelope::new(method_name, headers, deadline))
    }
}

impl Codec for Metadata {
    fn encode(self, dst: &mut BytesMut) -> Result<(), CodecError> {
        let count = u16::try_from(self.len())
            .map_err(|_| CodecError::Error(format!("Too many metadata entries: {}", self.len())))?;
        dst.put_u16(count);
        for (key, value) in self.iter() {
            encode_short_string(key, dst)?;
            match value {
                MetadataValue::Ascii(text) => {
                    dst.put_u8(METADATA_ASCII);
                    encode_long_bytes(text.as_bytes(), dst)?;
                }
                MetadataValue::Binary(bytes) => {
                    dst.put_u8(METADATA_BINARY);
                    encode_long_bytes(bytes, dst)?;
                }
            }
        }
        Ok(())
    }

    fn decode(src: &mut Bytes) -> Result<Self, CodecError> {
        ensure_remaining(src, SHORT_LEN_LEN, "metadata count")?;
        let count = src.get_u16();
        let mut metadata = Metadata::new();
        for _ in 0..count {
            let key = decode_short_string(src)?;
            ensure_remaining(src, 1, "metadata tag")?;
            let tag = src.get_u8();
            let value = decode_long_bytes(src)?;
            match tag {
                METADATA_ASCII => metadata.append(key, String::from_utf8(value.to_vec())?),
                METADATA_BINARY => metadata.append(key, value),
                other => {
                    return Err(CodecError::Error(format!(
                        "Unknown metadata value tag {}",
                        other
                    )))
                }
            }
        }
        Ok(metadata)
    }
}

/// code:4 detail~4 flags:1 (trailers){0,1}
impl Codec for Status {
    fn encode(self, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.put_u32(self.code() as u32);
        encode_long_bytes(self.detail().as_bytes(), dst)?;
        match self.trailers() {
            Some(trailers) => {
                dst.put_u8(StatusFlags::HAS_TRAILERS.bits());
                trailers.clone().encode(dst)?;
            }
            None => dst.put_u8(StatusFlags::NONE.bits()),
        }
        Ok(())
    }

    fn decode(src: &mut Bytes) -> Result<Self, CodecError> {
        ensure_remaining(src, 4, "status code")?;
        let code_value = src.get_u32();
        let code = Code::from_u32(code_value).ok_or(CodecError::UnknownStatusCode(code_value))?;
        let detail = String::from_utf8(decode_long_bytes(src)?.to_vec())?;
        ensure_remaining(src, 1, "status flags")?;
        let flags = decode_bitflag(src.get_u8(), StatusFlags::from_bits)?;
        let trailers = match flags.contains(StatusFlags::HAS_TRAILERS) {
            true => Some(Metadata::decode(src)?),
            false => None,
        };
        Ok(Status::new(code, detail, trailers))
    }
}

pub fn ensure_remaining(src: &Bytes, needed: usize, what: &'static str) -> Result<(), CodecError> {
    match src.remaining() < needed {
        true => Err(CodecError::Truncated(what, needed - src.remaining())),
        false => Ok(()),
    }
}

fn encode_short_string(value: &str, dst: &mut BytesMut) -> Result<(), CodecError> {
    let len = u16::try_from(value.len())
        .map_err(|_| CodecError::Error(format!("String too long: {} bytes", value.len())))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn decode_short_string(src: &mut Bytes) -> Result<String, CodecError> {
    ensure_remaining(src, SHORT_LEN_LEN, "string length")?;
    let len = src.get_u16() as usize;
    ensure_remaining(src, len, "string")?;
    Ok(String::from_utf8(src.split_to(len).to_vec())?)
}

fn encode_long_bytes(value: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
    let len = u32::try_from(value.len())
        .map_err(|_| CodecError::Error(format!("Value too long: {} bytes", value.len())))?;
    dst.put_u32(len);
    dst.put_slice(value);
    Ok(())
}

fn decode_long_bytes(src: &mut Bytes) -> Result<Bytes, CodecError> {
    ensure_remaining(src, LONG_LEN_LEN, "value length")?;
    let len = src.get_u32() as usize;
    ensure_remaining(src, len, "value")?;
    Ok(src.split_to(len))
}

fn decode_bitflag<T, F: Fn(u8) -> Option<T>>(byte: u8, decoder: F) -> Result<T, CodecError> {
    decoder(byte).ok_or_else(|| CodecError::Error(format!("Unknown flag: {}", byte)))
}
