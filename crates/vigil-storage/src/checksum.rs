//! Checksum support: a hashing writer that digests bytes as they stream to
//! disk, and the `checksum` file mapping each database file to its digest.
//!
//! Checksum records are `<name>;<algorithm>;<digest>` lines, where `<name>`
//! is the database-relative file name without any backup suffix.

use std::collections::BTreeMap;
use std::io::{self, Write};

use sha2::{Digest, Sha256};

use crate::error::{ParseError, StorageError};

/// The only digest algorithm vigil writes.
pub const ALGORITHM: &str = "sha256";

/// Name of the checksum file itself.
pub const CHECKSUM_FILE: &str = "checksum";

/// A writer that feeds everything written through a SHA-256 digest.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Finish, returning the wrapped writer and the hex digest.
    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Digest of a byte slice, hex-encoded.
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The parsed contents of a `checksum` file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChecksumSet {
    digests: BTreeMap<String, String>,
}

impl ChecksumSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the digest for a file name.
    pub fn record(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        self.digests.insert(name.into(), digest.into());
    }

    /// Parse the checksum file contents.
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        let mut set = Self::new();
        for (index, line) in content.lines().enumerate() {
            let mut fields = line.splitn(3, ';');
            let (name, algorithm, digest) =
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(name), Some(algorithm), Some(digest))
                        if !name.is_empty() && !digest.is_empty() =>
                    {
                        (name, algorithm, digest)
                    }
                    _ => {
                        return Err(ParseError {
                            file: CHECKSUM_FILE.to_owned(),
                            line: index + 1,
                            content: line.to_owned(),
                            reason: "expected <name>;<algorithm>;<digest>".to_owned(),
                        })
                    }
                };
            if algorithm != ALGORITHM {
                return Err(ParseError {
                    file: CHECKSUM_FILE.to_owned(),
                    line: index + 1,
                    content: line.to_owned(),
                    reason: format!("unsupported digest algorithm {algorithm:?}"),
                });
            }
            set.record(name, digest);
        }
        Ok(set)
    }

    /// Serialise in the on-disk record format.
    #[must_use]
    pub fn to_file_content(&self) -> String {
        let mut out = String::new();
        for (name, digest) in &self.digests {
            out.push_str(name);
            out.push(';');
            out.push_str(ALGORITHM);
            out.push(';');
            out.push_str(digest);
            out.push('\n');
        }
        out
    }

    /// Verify that `bytes` are the recorded contents of `name`.
    pub fn verify(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let Some(recorded) = self.digests.get(name) else {
            return Err(StorageError::Corrupted {
                reason: format!("no checksum recorded for {name:?}"),
            });
        };
        let actual = digest(bytes);
        if &actual == recorded {
            Ok(())
        } else {
            Err(StorageError::Corrupted {
                reason: format!("checksum mismatch for {name:?}"),
            })
        }
    }

    /// File names this set covers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.digests.keys().map(String::as_str)
    }
}
