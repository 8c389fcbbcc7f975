use crate::method::Marshaller;
use bytes::Bytes;

/// Passes payloads through untouched.
pub fn bytes() -> Marshaller<Bytes> {
    Marshaller::new(|message: &Bytes| Ok(message.clone()), Ok)
}

/// Utf8 string payloads. Invalid utf8 fails deserialization.
pub fn utf8() -> Marshaller<String> {
    Marshaller::new(
        |message: &String| Ok(Bytes::copy_from_slice(message.as_bytes())),
        |payload: Bytes| Ok(String::from_utf8(payload.to_vec())?),
    )
}
