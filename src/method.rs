use crate::errors::CodecError;
use crate::metadata::Metadata;
use bytes::Bytes;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;

/// Call shape: how many request and response messages a call carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl MethodType {
    /// Client sends zero or more messages followed by `RequestComplete`.
    pub fn client_streaming(&self) -> bool {
        matches!(self, MethodType::ClientStreaming | MethodType::DuplexStreaming)
    }

    /// Server sends zero or more messages before the final status.
    pub fn server_streaming(&self) -> bool {
        matches!(self, MethodType::ServerStreaming | MethodType::DuplexStreaming)
    }
}

type Serializer<T> = dyn Fn(&T) -> Result<Bytes, CodecError> + Send + Sync;
type Deserializer<T> = dyn Fn(Bytes) -> Result<T, CodecError> + Send + Sync;

/// Pluggable serialize / deserialize pair for one message type.
pub struct Marshaller<T> {
    serializer: Arc<Serializer<T>>,
    deserializer: Arc<Deserializer<T>>,
}

impl<T> Marshaller<T> {
    pub fn new<SER, DE>(serializer: SER, deserializer: DE) -> Marshaller<T>
    where
        SER: Fn(&T) -> Result<Bytes, CodecError> + Send + Sync + 'static,
        DE: Fn(Bytes) -> Result<T, CodecError> + Send + Sync + 'static,
    {
        Marshaller {
            serializer: Arc::new(serializer),
            deserializer: Arc::new(deserializer),
        }
    }

    pub fn serialize(&self, message: &T) -> Result<Bytes, CodecError> {
        (self.serializer)(message)
    }

    pub fn deserialize(&self, payload: Bytes) -> Result<T, CodecError> {
        (self.deserializer)(payload)
    }
}

impl<T> Clone for Marshaller<T> {
    fn clone(&self) -> Self {
        Marshaller {
            serializer: self.serializer.clone(),
            deserializer: self.deserializer.clone(),
        }
    }
}

impl<T> Debug for Marshaller<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Marshaller")
    }
}

/// Remote method: full name, shape and marshallers for both directions.
#[derive(Debug, Getters, CopyGetters)]
pub struct Method<REQ, RES> {
    #[get = "pub"]
    full_name: String,
    #[getset(get_copy = "pub")]
    method_type: MethodType,
    #[get = "pub"]
    request_marshaller: Marshaller<REQ>,
    #[get = "pub"]
    response_marshaller: Marshaller<RES>,
}

impl<REQ, RES> Method<REQ, RES> {
    pub fn new<STR: Into<String>>(
        method_type: MethodType,
        full_name: STR,
        request_marshaller: Marshaller<REQ>,
        response_marshaller: Marshaller<RES>,
    ) -> Method<REQ, RES> {
        Method {
            full_name: full_name.into(),
            method_type,
            request_marshaller,
            response_marshaller,
        }
    }
}

impl<REQ, RES> Clone for Method<REQ, RES> {
    fn clone(&self) -> Self {
        Method {
            full_name: self.full_name.clone(),
            method_type: self.method_type,
            request_marshaller: self.request_marshaller.clone(),
            response_marshaller: self.response_marshaller.clone(),
        }
    }
}

/// Per call options supplied by the caller.
#[derive(Debug, Clone, Default, Getters, CopyGetters)]
pub struct CallOptions {
    #[getset(get_copy = "pub")]
    deadline: Option<SystemTime>,
    #[get = "pub"]
    headers: Metadata,
    #[get = "pub"]
    cancellation_token: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> CallOptions {
        CallOptions::default()
    }

    pub fn with_deadline(mut self, deadline: SystemTime) -> CallOptions {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> CallOptions {
        self.with_deadline(SystemTime::now() + timeout)
    }

    pub fn with_headers(mut self, headers: Metadata) -> CallOptions {
        self.headers = headers;
        self
    }

    /// Cancelling `token` cancels the call.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> CallOptions {
        self.cancellation_token = Some(token);
        self
    }
}

/// Everything the wire protocol needs to know about one call.
#[derive(Debug, Clone, Getters, CopyGetters, new)]
pub struct CallDescriptor {
    #[get = "pub"]
    method_name: String,
    #[getset(get_copy = "pub")]
    method_type: MethodType,
    #[getset(get_copy = "pub")]
    deadline: Option<SystemTime>,
    #[get = "pub"]
    headers: Metadata,
}
