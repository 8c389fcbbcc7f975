use crate::errors::CodecError;
use crate::method::Marshaller;
use bytes::Bytes;
use serde_json::Value;

/// JSON document payloads.
pub fn value() -> Marshaller<Value> {
    Marshaller::new(
        |message: &Value| {
            serde_json::to_vec(message)
                .map(Bytes::from)
                .map_err(|err| CodecError::Error(format!("Failed to serialize JSON: {}", err)))
        },
        |payload: Bytes| {
            serde_json::from_slice(&payload)
                .map_err(|err| CodecError::Error(format!("Failed to parse JSON: {}", err)))
        },
    )
}
