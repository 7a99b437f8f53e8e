//! Crash-safety primitives: the guard sentinel, backup promotion, directory
//! syncing, and post-load cleanup of files the index no longer references.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::StorageError;

/// Suffix backup files carry until they are promoted.
pub const BACKUP_SUFFIX: &str = "~";

/// The sentinel whose presence marks an interrupted save.
pub const GUARD_FILE: &str = "guard";

/// Name of the advisory lock file.
pub const LOCK_FILE: &str = "lock";

fn guard_path(dir: &Path) -> PathBuf {
    dir.join(GUARD_FILE)
}

/// Whether a previous save left its guard behind.
#[must_use]
pub fn guard_exists(dir: &Path) -> bool {
    guard_path(dir).exists()
}

/// Create the guard sentinel and sync the directory so it is durable before
/// any rename happens.
pub fn create_guard(dir: &Path) -> Result<(), StorageError> {
    let path = guard_path(dir);
    fs::File::create(&path).map_err(|source| StorageError::CannotCreate { path, source })?;
    sync_dir(dir)?;
    Ok(())
}

/// Remove the guard sentinel, completing a save.
pub fn remove_guard(dir: &Path) -> Result<(), StorageError> {
    match fs::remove_file(guard_path(dir)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Durably flush directory metadata (renames, creations, removals).
pub fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    let handle = fs::File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

/// Atomically promote every `<name>~` in `names` to `<name>`, then sync the
/// directory. This is the rename half of the save protocol, also re-run
/// during recovery when a load had to fall back to the backups.
pub fn promote_backups<'a>(
    dir: &Path,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), StorageError> {
    for name in names {
        let backup = dir.join(format!("{name}{BACKUP_SUFFIX}"));
        if backup.exists() {
            fs::rename(&backup, dir.join(name))?;
        }
    }
    sync_dir(dir)?;
    Ok(())
}

/// Delete every regular file in the directory that is not in `keep` and is
/// not part of the storage machinery itself. Run after a successful load to
/// drop bucket files whose bucket no longer exists.
pub fn delete_non_indexed(dir: &Path, keep: &BTreeSet<String>) -> Result<(), StorageError> {
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        if name == GUARD_FILE || name == LOCK_FILE || keep.contains(&name) {
            continue;
        }
        debug!(file = %name, "removing non-indexed database file");
        if let Err(err) = fs::remove_file(dir_entry.path()) {
            warn!(file = %name, error = %err, "failed to remove stale database file");
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn guard_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!guard_exists(dir.path()));
        create_guard(dir.path()).unwrap();
        assert!(guard_exists(dir.path()));
        remove_guard(dir.path()).unwrap();
        assert!(!guard_exists(dir.path()));
        // Removing an absent guard is not an error.
        remove_guard(dir.path()).unwrap();
    }

    #[test]
    fn promote_renames_backups_over_primaries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("buckets"), "old").unwrap();
        fs::write(dir.path().join("buckets~"), "new").unwrap();
        fs::write(dir.path().join("_b~"), "fresh").unwrap();

        promote_backups(dir.path(), ["buckets", "_b", "_missing"].into_iter()).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("buckets")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dir.path().join("_b")).unwrap(), "fresh");
        assert!(!dir.path().join("buckets~").exists());
    }

    #[test]
    fn delete_non_indexed_spares_machinery_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["buckets", "checksum", "_keep", "_stale", GUARD_FILE, LOCK_FILE] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        let keep: BTreeSet<String> = ["buckets", "checksum", "_keep"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        delete_non_indexed(dir.path(), &keep).unwrap();

        assert!(dir.path().join("_keep").exists());
        assert!(!dir.path().join("_stale").exists());
        assert!(dir.path().join(GUARD_FILE).exists());
        assert!(dir.path().join(LOCK_FILE).exists());
    }
}
