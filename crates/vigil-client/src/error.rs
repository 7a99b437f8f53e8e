//! Error types for the client libraries.

use vigil_core::{ApiCode, OperationCode};
use vigil_protocol::ProtocolError;

/// Errors surfaced by the checker and admin clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The cache holds no usable entry; ask the service.
    #[error("cache miss")]
    CacheMiss,

    /// The daemon is not reachable (and reconnecting failed).
    #[error("service not available")]
    ServiceNotAvailable,

    /// Every sequence number is tied to an in-flight request.
    #[error("too many pending requests")]
    MaxPendingRequests,

    /// Called from within a callback, where reentering the client is
    /// forbidden.
    #[error("operation not allowed from within a callback")]
    OperationNotAllowed,

    /// The caller passed something unusable (unknown check id, bad key…).
    #[error("invalid parameter: {reason}")]
    InvalidParam { reason: String },

    /// The daemon answered an admin operation with a failure code.
    #[error("operation failed: {code:?}")]
    Operation { code: OperationCode },

    /// A simple check hit a policy only an agent could resolve.
    #[error("access cannot be resolved without an agent")]
    AccessNotResolved,

    /// The caller-supplied timeout elapsed before the answer arrived.
    #[error("timed out waiting for the service")]
    Timeout,

    /// The byte stream violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// The wire/CLI code for this error.
    #[must_use]
    pub fn api_code(&self) -> ApiCode {
        match self {
            Self::CacheMiss => ApiCode::UnexpectedError,
            Self::ServiceNotAvailable => ApiCode::ServiceNotAvailable,
            Self::MaxPendingRequests => ApiCode::MaxPendingRequests,
            Self::OperationNotAllowed => ApiCode::OperationNotAllowed,
            Self::InvalidParam { .. } => ApiCode::InvalidParam,
            Self::Operation { code } => code.as_api_code(),
            Self::AccessNotResolved => ApiCode::AccessNotResolved,
            Self::Timeout => ApiCode::ServiceNotAvailable,
            Self::Protocol(err) => match err {
                ProtocolError::WrongOpCode { .. } => ApiCode::WrongOpCode,
                ProtocolError::OutOfData => ApiCode::OutOfData,
                _ => ApiCode::InvalidProtocol,
            },
            Self::Io(_) => ApiCode::OperationFailed,
        }
    }
}
