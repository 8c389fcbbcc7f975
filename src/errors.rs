use crate::config::ConfigBuilderError;
use crate::status::{Code, Status};
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

/// Crate level error, returned by server and registry operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Represents general error.
    #[error("RPC error: {0}")]
    Error(String),

    #[error(transparent)]
    CodecError(#[from] CodecError),

    #[error(transparent)]
    ConnectionError(#[from] ConnectionError),

    #[error(transparent)]
    ConfigError(#[from] ConfigBuilderError),

    #[error("Handler registration error: {0}")]
    RegistrationError(String),
}

/// Wire unit encoding error.
#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("Codec error: {0}")]
    Error(String),

    /// Represents all cases of `std::io::Error`.
    #[error(transparent)]
    IoError(#[from] IoError),

    #[error(transparent)]
    StringDecodingError(#[from] FromUtf8Error),

    #[error("Frame of {0} bytes exceeds limit of {1} bytes")]
    FrameTooLarge(usize, usize),

    #[error("Truncated {0}: needed {1} more bytes")]
    Truncated(&'static str, usize),

    #[error("Unknown frame kind {0}")]
    UnknownFrameKind(u8),

    #[error("Unknown status code {0}")]
    UnknownStatusCode(u32),
}

/// Connection error.
///
/// Variants follow how a failure is reported to the call: `Unavailable` for a peer
/// that went away, `Internal` for everything that should not have happened.
#[derive(Error, Debug, PartialEq)]
pub enum ConnectionError {
    #[error("Connection unavailable: {0}")]
    Unavailable(String),

    #[error("Connection failure: {0}")]
    Internal(String),

    /// Read or write was abandoned because its cancellation token fired.
    #[error("Connection operation cancelled")]
    Cancelled,

    /// Read or write attempted after an earlier one was cancelled or the connection closed.
    #[error("Connection {0} side interrupted")]
    Interrupted(&'static str),
}

/// Request handler error.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Explicit status, forwarded to the client verbatim.
    #[error(transparent)]
    Status(#[from] Status),

    /// Handler gave up because the call got cancelled.
    #[error("Handler cancelled")]
    Cancelled,

    /// A general error.
    #[error("Handler error: {0}")]
    GeneralError(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub struct IoError(std::io::Error);

impl IoError {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

impl PartialEq for IoError {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

impl Display for IoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::IoError(IoError(err))
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => ConnectionError::Unavailable(err.to_string()),
            _ => ConnectionError::Internal(err.to_string()),
        }
    }
}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::IoError(IoError(io_err)) => ConnectionError::from(io_err),
            other => ConnectionError::Internal(other.to_string()),
        }
    }
}

impl From<String> for RpcError {
    fn from(err: String) -> Self {
        RpcError::Error(err)
    }
}

impl From<String> for CodecError {
    fn from(err: String) -> Self {
        CodecError::Error(err)
    }
}

impl From<String> for HandlerError {
    fn from(err: String) -> Self {
        HandlerError::GeneralError(err)
    }
}

impl From<&str> for HandlerError {
    fn from(err: &str) -> Self {
        HandlerError::GeneralError(err.to_owned())
    }
}

impl From<ConnectionError> for Status {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Unavailable(detail) => Status::unavailable(detail),
            ConnectionError::Cancelled => Status::cancelled("Call cancelled"),
            other => Status::internal(other.to_string()),
        }
    }
}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Self {
        Status::with_code(Code::Internal, err.to_string())
    }
}
