use crate::metadata::Metadata;
use std::fmt::{Display, Formatter};
use strum_macros::Display as StrumDisplay;

/// Status codes, shared with gRPC ([status codes](https://grpc.github.io/grpc/core/md_doc_statuscodes.html)).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, StrumDisplay)]
pub enum Code {
    #[strum(serialize = "OK")]
    Ok = 0,
    #[strum(serialize = "CANCELLED")]
    Cancelled = 1,
    #[strum(serialize = "UNKNOWN")]
    Unknown = 2,
    #[strum(serialize = "INVALID_ARGUMENT")]
    InvalidArgument = 3,
    #[strum(serialize = "DEADLINE_EXCEEDED")]
    DeadlineExceeded = 4,
    #[strum(serialize = "NOT_FOUND")]
    NotFound = 5,
    #[strum(serialize = "ALREADY_EXISTS")]
    AlreadyExists = 6,
    #[strum(serialize = "PERMISSION_DENIED")]
    PermissionDenied = 7,
    #[strum(serialize = "RESOURCE_EXHAUSTED")]
    ResourceExhausted = 8,
    #[strum(serialize = "FAILED_PRECONDITION")]
    FailedPrecondition = 9,
    #[strum(serialize = "ABORTED")]
    Aborted = 10,
    #[strum(serialize = "OUT_OF_RANGE")]
    OutOfRange = 11,
    #[strum(serialize = "UNIMPLEMENTED")]
    Unimplemented = 12,
    #[strum(serialize = "INTERNAL")]
    Internal = 13,
    #[strum(serialize = "UNAVAILABLE")]
    Unavailable = 14,
    #[strum(serialize = "DATA_LOSS")]
    DataLoss = 15,
    #[strum(serialize = "UNAUTHENTICATED")]
    Unauthenticated = 16,
}

/// Final outcome of a call.
///
/// The only error type callers of the client API ever observe: transport failures,
/// protocol violations and handler failures all end up here.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters, new)]
pub struct Status {
    #[getset(get_copy = "pub")]
    code: Code,
    #[get = "pub"]
    detail: String,
    #[get = "pub"]
    trailers: Option<Metadata>,
}

impl Status {
    pub fn ok() -> Status {
        Status::new(Code::Ok, String::new(), None)
    }

    pub fn with_code<STR: Into<String>>(code: Code, detail: STR) -> Status {
        Status::new(code, detail.into(), None)
    }

    pub fn cancelled<STR: Into<String>>(detail: STR) -> Status {
        Status::with_code(Code::Cancelled, detail)
    }

    pub fn deadline_exceeded<STR: Into<String>>(detail: STR) -> Status {
        Status::with_code(Code::DeadlineExceeded, detail)
    }

    pub fn unavailable<STR: Into<String>>(detail: STR) -> Status {
        Status::with_code(Code::Unavailable, detail)
    }

    pub fn internal<STR: Into<String>>(detail: STR) -> Status {
        Status::with_code(Code::Internal, detail)
    }

    pub fn unknown<STR: Into<String>>(detail: STR) -> Status {
        Status::with_code(Code::Unknown, detail)
    }

    pub fn unimplemented<STR: Into<String>>(detail: STR) -> Status {
        Status::with_code(Code::Unimplemented, detail)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Replaces trailers. Empty metadata is stored as `None`, so it is not sent on the wire.
    pub fn with_trailers(mut self, trailers: Metadata) -> Status {
        self.trailers = match trailers.is_empty() {
            true => None,
            false => Some(trailers),
        };
        self
    }

    pub(crate) fn into_result(self) -> Result<(), Status> {
        match self.is_ok() {
            true => Ok(()),
            false => Err(self),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "status: {}, detail: '{}'", self.code, self.detail)
    }
}

impl std::error::Error for Status {}
