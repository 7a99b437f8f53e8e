//! Numeric result codes shared by the wire protocol, the client libraries,
//! and the CLI exit status.
//!
//! [`ApiCode`] is the caller-facing taxonomy: zero for success, a distinct
//! negative value per failure kind. [`OperationCode`] is the small positive
//! enum admin mutation responses carry.

use crate::error::{KeyError, PluginError, StoreError};

/// Caller-facing result codes, stable on the wire and as CLI exit causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ApiCode {
    Success = 0,
    InvalidParam = -1,
    MaxPendingRequests = -2,
    OperationNotAllowed = -3,
    InvalidCommandline = -4,
    ServiceNotAvailable = -5,
    OperationFailed = -6,
    DatabaseCorrupted = -7,
    BucketNotExists = -8,
    UnknownPolicyType = -9,
    FileLockAcquire = -10,
    FileNotFound = -11,
    CannotCreateFile = -12,
    WrongOpCode = -13,
    OutOfData = -14,
    InvalidProtocol = -15,
    PluginNotFound = -16,
    PluginError = -17,
    OutOfMemory = -18,
    UnexpectedError = -19,
    /// A simple check could not resolve without asking an agent.
    AccessNotResolved = -20,
}

impl ApiCode {
    #[must_use]
    pub const fn raw(self) -> i32 {
        self as i32
    }

    /// Decode a wire value; unknown values collapse to `UnexpectedError`.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Success,
            -1 => Self::InvalidParam,
            -2 => Self::MaxPendingRequests,
            -3 => Self::OperationNotAllowed,
            -4 => Self::InvalidCommandline,
            -5 => Self::ServiceNotAvailable,
            -6 => Self::OperationFailed,
            -7 => Self::DatabaseCorrupted,
            -8 => Self::BucketNotExists,
            -9 => Self::UnknownPolicyType,
            -10 => Self::FileLockAcquire,
            -11 => Self::FileNotFound,
            -12 => Self::CannotCreateFile,
            -13 => Self::WrongOpCode,
            -14 => Self::OutOfData,
            -15 => Self::InvalidProtocol,
            -16 => Self::PluginNotFound,
            -17 => Self::PluginError,
            -18 => Self::OutOfMemory,
            -19 => Self::UnexpectedError,
            -20 => Self::AccessNotResolved,
            _ => Self::UnexpectedError,
        }
    }
}

/// Result codes carried by admin mutation responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OperationCode {
    Ok = 0,
    Failed = 1,
    NoBucket = 2,
    NoPolicyType = 3,
    NotAllowed = 4,
    DbCorrupted = 5,
}

impl OperationCode {
    #[must_use]
    pub const fn raw(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Ok,
            2 => Self::NoBucket,
            3 => Self::NoPolicyType,
            4 => Self::NotAllowed,
            5 => Self::DbCorrupted,
            _ => Self::Failed,
        }
    }

    /// Map a code back to the caller-facing taxonomy.
    #[must_use]
    pub const fn as_api_code(self) -> ApiCode {
        match self {
            Self::Ok => ApiCode::Success,
            Self::Failed => ApiCode::OperationFailed,
            Self::NoBucket => ApiCode::BucketNotExists,
            Self::NoPolicyType => ApiCode::UnknownPolicyType,
            Self::NotAllowed => ApiCode::OperationNotAllowed,
            Self::DbCorrupted => ApiCode::DatabaseCorrupted,
        }
    }
}

impl From<&StoreError> for OperationCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::BucketNotExists { .. } => Self::NoBucket,
            StoreError::UnknownPolicyType { .. } => Self::NoPolicyType,
            StoreError::RootBucketDeletion
            | StoreError::RootBucketNone
            | StoreError::DefaultIsLink
            | StoreError::InvalidBucketId { .. }
            | StoreError::SelfLink { .. }
            | StoreError::InvalidPolicy { .. }
            | StoreError::Key(_) => Self::NotAllowed,
            StoreError::BucketExists { .. } => Self::Failed,
        }
    }
}

impl From<&StoreError> for ApiCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::BucketNotExists { .. } => Self::BucketNotExists,
            StoreError::UnknownPolicyType { .. } => Self::UnknownPolicyType,
            StoreError::Key(_)
            | StoreError::InvalidBucketId { .. }
            | StoreError::SelfLink { .. }
            | StoreError::InvalidPolicy { .. } => Self::InvalidParam,
            StoreError::RootBucketDeletion
            | StoreError::RootBucketNone
            | StoreError::DefaultIsLink => Self::OperationNotAllowed,
            StoreError::BucketExists { .. } => Self::OperationFailed,
        }
    }
}

impl From<&PluginError> for ApiCode {
    fn from(err: &PluginError) -> Self {
        match err {
            PluginError::NotFound { .. } => Self::PluginNotFound,
            PluginError::TypeReserved { .. } | PluginError::AlreadyRegistered { .. } => {
                Self::PluginError
            }
        }
    }
}

impl From<&KeyError> for ApiCode {
    fn from(_: &KeyError) -> Self {
        Self::InvalidParam
    }
}
