//! On-disk persistence for vigil.
//!
//! The database is a directory of line-oriented text files: a `buckets`
//! index, one `_<bucket-id>` file per bucket, and a `checksum` file covering
//! both. Saves are crash-safe: new contents stream into `~`-suffixed backup
//! files through a hashing writer, a `guard` sentinel marks the rename
//! window, and loads prefer the backups whenever the sentinel survived a
//! crash. The directory is owned exclusively through an advisory file lock.

pub mod backend;
pub mod checksum;
pub mod error;
pub mod format;
pub mod integrity;

pub use backend::Database;
pub use error::{ParseError, StorageError};
