//! Error types for `vigil-storage`.

use std::path::PathBuf;

use vigil_core::ApiCode;

/// A malformed record in a database file.
#[derive(Debug, thiserror::Error)]
#[error("{file}:{line}: bad record {content:?}: {reason}")]
pub struct ParseError {
    /// File the record came from (database-relative name).
    pub file: String,
    /// 1-based line number.
    pub line: usize,
    /// The offending line.
    pub content: String,
    pub reason: String,
}

/// Errors from loading, saving, or locking the database directory.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The database failed verification or parsing; its contents cannot be
    /// trusted.
    #[error("database corrupted: {reason}")]
    Corrupted { reason: String },

    /// Another process holds the database lock.
    #[error("cannot acquire database lock at {path}")]
    LockBusy { path: PathBuf },

    /// A file referenced by the database is missing.
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// A database file could not be created.
    #[error("cannot create {path}: {source}")]
    CannotCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Any other I/O failure against the database directory.
    #[error("database i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ParseError> for StorageError {
    fn from(err: ParseError) -> Self {
        Self::Corrupted {
            reason: err.to_string(),
        }
    }
}

impl From<&StorageError> for ApiCode {
    fn from(err: &StorageError) -> Self {
        match err {
            StorageError::Corrupted { .. } => Self::DatabaseCorrupted,
            StorageError::LockBusy { .. } => Self::FileLockAcquire,
            StorageError::FileNotFound { .. } => Self::FileNotFound,
            StorageError::CannotCreate { .. } => Self::CannotCreateFile,
            StorageError::Io(_) => Self::OperationFailed,
        }
    }
}
