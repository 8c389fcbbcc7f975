pub mod payloads;

use crate::errors::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Length of the length prefix of every wire unit (4 bytes, u32 BE).
pub const LENGTH_PREFIX_LENGTH: usize = 4;

/// Marker sent before each unit following the request envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FrameKind {
    /// Followed by one request payload blob.
    RequestData = 0x1,
    /// Client abandons the call (no body).
    RequestCancel = 0x2,
    /// Client is done streaming requests (no body).
    RequestComplete = 0x3,
    /// Followed by one metadata unit.
    ResponseHeaders = 0x4,
    /// Followed by one response payload blob.
    ResponseData = 0x5,
    /// Followed by one status unit. Last frame of a call.
    ResponseComplete = 0x6,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, CopyGetters, new)]
pub struct Frame {
    #[getset(get_copy = "pub")]
    kind: FrameKind,
}

impl From<FrameKind> for Frame {
    fn from(kind: FrameKind) -> Self {
        Frame::new(kind)
    }
}

impl payloads::Codec for Frame {
    fn encode(self, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.put_u8(self.kind as u8);
        Ok(())
    }

    fn decode(src: &mut Bytes) -> Result<Self, CodecError> {
        payloads::ensure_remaining(src, 1, "frame")?;
        let kind_byte = src.get_u8();
        match FrameKind::from_u8(kind_byte) {
            Some(kind) => Ok(Frame::new(kind)),
            None => Err(CodecError::UnknownFrameKind(kind_byte)),
        }
    }
}

/// Length-prefixed codec: every unit is `[u32 BE length][length bytes]`.
#[derive(Debug, Clone, new)]
pub struct BlobCodec {
    max_length: usize,
}

impl Encoder<Bytes> for BlobCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let limit = self.max_length.min(u32::MAX as usize);
        if item.len() > limit {
            return Err(CodecError::FrameTooLarge(item.len(), limit));
        }
        dst.reserve(LENGTH_PREFIX_LENGTH + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for BlobCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LENGTH {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_LENGTH];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LENGTH]);
        let length = u32::from_be_bytes(prefix) as usize;
        if length > self.max_length {
            return Err(CodecError::FrameTooLarge(length, self.max_length));
        }
        if src.len() < LENGTH_PREFIX_LENGTH + length {
            src.reserve(LENGTH_PREFIX_LENGTH + length - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LENGTH);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(blob) => Ok(Some(blob)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::from(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Stream ended inside a unit, {} bytes buffered", src.len()),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::payloads::Codec;
    use super::*;
    use test_case::test_case;

    const MAX: usize = 1024 * 1024;

    #[test_case(0; "empty")]
    #[test_case(1; "one byte")]
    #[test_case(3; "shorter than prefix")]
    #[test_case(4096; "page")]
    #[test_case(MAX; "at limit")]
    fn blob_round_trip(length: usize) -> Result<(), anyhow::Error> {
        let blob: Bytes = (0..length).map(|i| (i % 251) as u8).collect();
        let mut codec = BlobCodec::new(MAX);
        let mut buffer = BytesMut::new();
        codec.encode(blob.clone(), &mut buffer)?;
        assert_eq!(LENGTH_PREFIX_LENGTH + length, buffer.len());
        assert_eq!(Some(blob), codec.decode(&mut buffer)?);
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn waits_for_complete_unit() -> Result<(), anyhow::Error> {
        let mut codec = BlobCodec::new(MAX);
        let mut buffer = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut buffer)?;
        codec.encode(Bytes::from_static(b"!"), &mut buffer)?;
        let mut partial = buffer.split_to(7);
        assert_eq!(None, codec.decode(&mut partial)?);
        partial.unsplit(buffer);
        assert_eq!(Some(Bytes::from_static(b"hello")), codec.decode(&mut partial)?);
        assert_eq!(Some(Bytes::from_static(b"!")), codec.decode(&mut partial)?);
        assert_eq!(None, codec.decode(&mut partial)?);
        Ok(())
    }

    #[test]
    fn rejects_oversized_units() {
        let mut codec = BlobCodec::new(8);
        let mut buffer = BytesMut::new();
        assert_eq!(
            Err(CodecError::FrameTooLarge(9, 8)),
            codec.encode(Bytes::from(vec![0u8; 9]), &mut buffer)
        );
        buffer.put_u32(9);
        assert_eq!(Err(CodecError::FrameTooLarge(9, 8)), codec.decode(&mut buffer));
    }

    #[test_case(FrameKind::RequestData, 0x1)]
    #[test_case(FrameKind::RequestCancel, 0x2)]
    #[test_case(FrameKind::RequestComplete, 0x3)]
    #[test_case(FrameKind::ResponseHeaders, 0x4)]
    #[test_case(FrameKind::ResponseData, 0x5)]
    #[test_case(FrameKind::ResponseComplete, 0x6)]
    fn frame_kind_byte(kind: FrameKind, byte: u8) -> Result<(), anyhow::Error> {
        let mut encoded = Frame::new(kind).encode_bytes()?;
        assert_eq!(&[byte], encoded.as_ref());
        assert_eq!(Frame::new(kind), Frame::decode(&mut encoded)?);
        Ok(())
    }

    #[test]
    fn unknown_frame_kind() {
        let mut encoded = Bytes::from_static(&[0x7f]);
        assert_eq!(
            Err(CodecError::UnknownFrameKind(0x7f)),
            Frame::decode(&mut encoded)
        );
    }
}
