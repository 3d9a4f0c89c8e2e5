//! Error taxonomy: protocol codes, session-level conditions, local conditions.

use thiserror::Error;

use crate::proto::frame::FrameError;
use crate::proto::wire::WireError;

/// Classification of every error the client can surface.
///
/// Protocol codes mirror the server's wire values; transport-layer kinds
/// (`TooManyPendingOps`, `Canceled`, `DeadlineExceeded`) never appear on the
/// wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SystemError,
    RuntimeInconsistency,
    DataInconsistency,
    ConnectionLoss,
    MarshallingError,
    Unimplemented,
    OperationTimeout,
    BadArguments,
    NoNode,
    NoAuth,
    BadVersion,
    NoChildrenForEphemerals,
    NodeExists,
    NotEmpty,
    SessionExpired,
    InvalidAcl,
    AuthFailed,
    TooManyPendingOps,
    Canceled,
    DeadlineExceeded,
}

impl ErrorCode {
    /// The server-side value for protocol codes, `None` for local kinds.
    pub fn wire_code(self) -> Option<i32> {
        match self {
            ErrorCode::SystemError => Some(-1),
            ErrorCode::RuntimeInconsistency => Some(-2),
            ErrorCode::DataInconsistency => Some(-3),
            ErrorCode::ConnectionLoss => Some(-4),
            ErrorCode::MarshallingError => Some(-5),
            ErrorCode::Unimplemented => Some(-6),
            ErrorCode::OperationTimeout => Some(-7),
            ErrorCode::BadArguments => Some(-8),
            ErrorCode::NoNode => Some(-101),
            ErrorCode::NoAuth => Some(-102),
            ErrorCode::BadVersion => Some(-103),
            ErrorCode::NoChildrenForEphemerals => Some(-108),
            ErrorCode::NodeExists => Some(-110),
            ErrorCode::NotEmpty => Some(-111),
            ErrorCode::SessionExpired => Some(-112),
            ErrorCode::InvalidAcl => Some(-114),
            ErrorCode::AuthFailed => Some(-115),
            ErrorCode::TooManyPendingOps
            | ErrorCode::Canceled
            | ErrorCode::DeadlineExceeded => None,
        }
    }

    pub fn from_wire(code: i32) -> Option<ErrorCode> {
        match code {
            -1 => Some(ErrorCode::SystemError),
            -2 => Some(ErrorCode::RuntimeInconsistency),
            -3 => Some(ErrorCode::DataInconsistency),
            -4 => Some(ErrorCode::ConnectionLoss),
            -5 => Some(ErrorCode::MarshallingError),
            -6 => Some(ErrorCode::Unimplemented),
            -7 => Some(ErrorCode::OperationTimeout),
            -8 => Some(ErrorCode::BadArguments),
            -101 => Some(ErrorCode::NoNode),
            -102 => Some(ErrorCode::NoAuth),
            -103 => Some(ErrorCode::BadVersion),
            -108 => Some(ErrorCode::NoChildrenForEphemerals),
            -110 => Some(ErrorCode::NodeExists),
            -111 => Some(ErrorCode::NotEmpty),
            -112 => Some(ErrorCode::SessionExpired),
            -114 => Some(ErrorCode::InvalidAcl),
            -115 => Some(ErrorCode::AuthFailed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SystemError => "system error",
            ErrorCode::RuntimeInconsistency => "runtime inconsistency",
            ErrorCode::DataInconsistency => "data inconsistency",
            ErrorCode::ConnectionLoss => "connection loss",
            ErrorCode::MarshallingError => "marshalling error",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::OperationTimeout => "operation timeout",
            ErrorCode::BadArguments => "bad arguments",
            ErrorCode::NoNode => "node does not exist",
            ErrorCode::NoAuth => "not authenticated",
            ErrorCode::BadVersion => "version conflict",
            ErrorCode::NoChildrenForEphemerals => "ephemeral nodes may not have children",
            ErrorCode::NodeExists => "node already exists",
            ErrorCode::NotEmpty => "node has children",
            ErrorCode::SessionExpired => "session expired",
            ErrorCode::InvalidAcl => "invalid ACL",
            ErrorCode::AuthFailed => "authentication failed",
            ErrorCode::TooManyPendingOps => "too many pending operations",
            ErrorCode::Canceled => "canceled",
            ErrorCode::DeadlineExceeded => "deadline exceeded",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured client error.
///
/// Not a "god error": every failure carries exactly one [`ErrorCode`] plus a
/// human-readable message, and a retryability hint for callers composing
/// their own retry layers.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    retryable: bool,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }

    /// Maps a raw server error code. Unknown values surface as
    /// `SystemError` with the raw value preserved in the message.
    pub fn protocol(raw: i32) -> Self {
        match ErrorCode::from_wire(raw) {
            Some(code) => Self::new(code, code.as_str(), code == ErrorCode::ConnectionLoss),
            None => Self::new(
                ErrorCode::SystemError,
                format!("server error code {raw}"),
                false,
            ),
        }
    }

    pub(crate) fn connection_loss() -> Self {
        Self::new(ErrorCode::ConnectionLoss, "connection lost", true)
    }

    pub(crate) fn session_expired() -> Self {
        Self::new(ErrorCode::SessionExpired, "session expired", false)
    }

    pub(crate) fn canceled() -> Self {
        Self::new(ErrorCode::Canceled, "canceled", false)
    }

    pub(crate) fn deadline_exceeded() -> Self {
        Self::new(ErrorCode::DeadlineExceeded, "deadline exceeded", false)
    }

    pub(crate) fn too_many_pending() -> Self {
        Self::new(ErrorCode::TooManyPendingOps, "request queue is full", true)
    }

    pub(crate) fn bad_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadArguments, message, false)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether retrying the operation may succeed without changing inputs.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::new(ErrorCode::MarshallingError, err.to_string(), false)
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(_) => Error::new(ErrorCode::ConnectionLoss, err.to_string(), true),
            FrameError::LengthInvalid { .. } | FrameError::TooLarge { .. } => {
                Error::new(ErrorCode::MarshallingError, err.to_string(), false)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
