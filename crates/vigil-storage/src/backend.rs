//! Load/save orchestration over the database directory.
//!
//! A [`Database`] owns the directory through an advisory `flock`; a second
//! daemon instance fails fast instead of corrupting the store. Saves follow
//! the guard protocol: stream new contents into `~` backups through the
//! hashing writer, durably record the guard, promote the backups by rename,
//! sync, drop the guard. Loads prefer the backups whenever the guard
//! survived, which makes a crash anywhere inside the rename window
//! recoverable to the freshly saved state.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use vigil_core::{PolicyBucket, PolicyStore};

use crate::checksum::{ChecksumSet, HashingWriter, CHECKSUM_FILE};
use crate::error::StorageError;
use crate::format::{self, INDEX_FILE};
use crate::integrity::{self, BACKUP_SUFFIX, LOCK_FILE};

/// Handle on an exclusively locked database directory.
#[derive(Debug)]
pub struct Database {
    dir: PathBuf,
    /// Keeps the advisory lock alive for the daemon's lifetime.
    _lock: fs::File,
}

impl Database {
    /// Open the directory (creating it if needed) and take the exclusive
    /// advisory lock.
    ///
    /// # Errors
    ///
    /// - [`StorageError::LockBusy`] when another process holds the lock.
    /// - [`StorageError::CannotCreate`] when the directory or lock file
    ///   cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::CannotCreate {
            path: dir.clone(),
            source,
        })?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StorageError::CannotCreate {
                path: lock_path.clone(),
                source,
            })?;
        acquire_flock(&lock, &lock_path)?;

        Ok(Self { dir, _lock: lock })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the store from disk.
    ///
    /// An empty directory loads as a fresh store with only the root bucket.
    /// When the guard sentinel is present the `~` backups are preferred and,
    /// after a successful load, promoted to primaries. Files the index no
    /// longer references are removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] on checksum mismatch or a
    /// malformed record. The caller latches that state.
    pub fn load(&self) -> Result<PolicyStore, StorageError> {
        let recovering = integrity::guard_exists(&self.dir);
        if recovering {
            warn!(dir = %self.dir.display(), "guard present, recovering from backup files");
        }

        if !self.file_exists(INDEX_FILE, recovering) {
            info!(dir = %self.dir.display(), "no database index, starting fresh");
            return Ok(PolicyStore::new());
        }

        let checksums = ChecksumSet::parse(&String::from_utf8_lossy(
            &self.read_file(CHECKSUM_FILE, recovering).map_err(corrupt_if_missing)?,
        ))
        .map_err(StorageError::from)?;

        let index_bytes = self.read_file(INDEX_FILE, recovering)?;
        checksums.verify(INDEX_FILE, &index_bytes)?;
        let index = format::parse_index(&String::from_utf8_lossy(&index_bytes))?;

        let mut buckets = Vec::with_capacity(index.len());
        for record in &index {
            let file_name = format::bucket_file_name(&record.bucket_id);
            let bytes = self
                .read_file(&file_name, recovering)
                .map_err(corrupt_if_missing)?;
            checksums.verify(&file_name, &bytes)?;
            let policies =
                format::parse_bucket_policies(&file_name, &String::from_utf8_lossy(&bytes))?;

            let mut bucket =
                PolicyBucket::new(record.bucket_id.clone(), record.default.clone()).map_err(
                    |err| StorageError::Corrupted {
                        reason: format!("bucket {:?}: {err}", record.bucket_id),
                    },
                )?;
            for policy in policies {
                bucket.insert(policy);
            }
            buckets.push(bucket);
        }

        let store = PolicyStore::from_buckets(buckets);

        if recovering {
            // Finish the interrupted save: the backups are intact, so re-run
            // the rename half and drop the guard.
            let names: Vec<String> = self.persisted_file_names(&store);
            integrity::promote_backups(&self.dir, names.iter().map(String::as_str))?;
            integrity::remove_guard(&self.dir)?;
            info!(dir = %self.dir.display(), "backup recovery complete");
        }

        let keep: BTreeSet<String> = self.persisted_file_names(&store).into_iter().collect();
        integrity::delete_non_indexed(&self.dir, &keep)?;

        info!(
            buckets = store.buckets().count(),
            dir = %self.dir.display(),
            "database loaded"
        );
        Ok(store)
    }

    /// Persist the store with the crash-safe guard protocol.
    pub fn save(&self, store: &PolicyStore) -> Result<(), StorageError> {
        let mut checksums = ChecksumSet::new();

        // New contents stream into backups through the hashing writer.
        let index_digest =
            self.write_backup(INDEX_FILE, format::serialize_index(store.buckets()).as_bytes())?;
        checksums.record(INDEX_FILE, index_digest);

        for bucket in store.buckets() {
            let file_name = format::bucket_file_name(bucket.id());
            let digest =
                self.write_backup(&file_name, format::serialize_bucket(bucket).as_bytes())?;
            checksums.record(file_name, digest);
        }

        self.write_backup(CHECKSUM_FILE, checksums.to_file_content().as_bytes())?;
        integrity::sync_dir(&self.dir)?;

        // From here until the guard is removed, a crash recovers from the
        // backups.
        integrity::create_guard(&self.dir)?;

        let names = self.persisted_file_names(store);
        integrity::promote_backups(&self.dir, names.iter().map(String::as_str))?;
        integrity::remove_guard(&self.dir)?;

        info!(buckets = store.buckets().count(), "database saved");
        Ok(())
    }

    /// Every file name the store persists as: index, checksum, one file per
    /// bucket.
    fn persisted_file_names(&self, store: &PolicyStore) -> Vec<String> {
        let mut names = vec![INDEX_FILE.to_owned(), CHECKSUM_FILE.to_owned()];
        names.extend(store.buckets().map(|b| format::bucket_file_name(b.id())));
        names
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{BACKUP_SUFFIX}"))
    }

    fn write_backup(&self, name: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let path = self.backup_path(name);
        let file = fs::File::create(&path).map_err(|source| StorageError::CannotCreate {
            path: path.clone(),
            source,
        })?;
        let mut writer = HashingWriter::new(file);
        writer.write_all(bytes)?;
        let (file, digest) = writer.finish();
        file.sync_all()?;
        Ok(digest)
    }

    fn file_exists(&self, name: &str, prefer_backup: bool) -> bool {
        (prefer_backup && self.backup_path(name).exists()) || self.dir.join(name).exists()
    }

    /// Read a database file. During recovery the `~` copy is preferred; a
    /// missing backup falls through to the primary, which covers crashes in
    /// the middle of the rename pass.
    fn read_file(&self, name: &str, prefer_backup: bool) -> Result<Vec<u8>, StorageError> {
        if prefer_backup {
            match fs::read(self.backup_path(name)) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        fs::read(self.dir.join(name)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound {
                    path: self.dir.join(name),
                }
            } else {
                err.into()
            }
        })
    }
}

/// A file the index or checksum references going missing means the database
/// as a whole cannot be trusted.
fn corrupt_if_missing(err: StorageError) -> StorageError {
    match err {
        StorageError::FileNotFound { path } => StorageError::Corrupted {
            reason: format!("missing database file {}", path.display()),
        },
        other => other,
    }
}

#[cfg(unix)]
fn acquire_flock(file: &fs::File, path: &Path) -> Result<(), StorageError> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: `flock` is a POSIX syscall taking a valid open fd (borrowed
    // from `file`, which outlives the call) and flag bits; it has no
    // memory safety implications. EWOULDBLOCK means another daemon owns
    // the database.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Err(StorageError::LockBusy {
                path: path.to_path_buf(),
            })
        } else {
            Err(err.into())
        }
    }
}

#[cfg(not(unix))]
fn acquire_flock(_file: &fs::File, _path: &Path) -> Result<(), StorageError> {
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use vigil_core::types::{Policy, PolicyKey, PolicyResult};
    use vigil_core::ROOT_BUCKET;

    fn key(c: &str, u: &str, p: &str) -> PolicyKey {
        PolicyKey::new(c, u, p).unwrap()
    }

    fn sample_store() -> PolicyStore {
        let mut store = PolicyStore::new();
        store.create_bucket("extra", PolicyResult::none()).unwrap();
        let mut batch = BTreeMap::new();
        batch.insert(
            ROOT_BUCKET.to_owned(),
            vec![
                Policy::new(key("app", "*", "net"), PolicyResult::allow()),
                Policy::new(key("app", "alice", "gps"), PolicyResult::bucket("extra")),
            ],
        );
        batch.insert(
            "extra".to_owned(),
            vec![Policy::new(key("app", "alice", "gps"), PolicyResult::allow())],
        );
        store.insert_policies(&batch).unwrap();
        store
    }

    fn dump_all(store: &PolicyStore) -> String {
        let mut out = format::serialize_index(store.buckets());
        for bucket in store.buckets() {
            out.push_str(&format::serialize_bucket(bucket));
        }
        out
    }

    #[test]
    fn empty_directory_loads_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let store = db.load().unwrap();
        assert!(store.contains_bucket(ROOT_BUCKET));
        assert_eq!(store.buckets().count(), 1);
    }

    #[test]
    fn save_then_load_round_trips_byte_identically() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let store = sample_store();

        db.save(&store).unwrap();
        let loaded = db.load().unwrap();
        assert_eq!(dump_all(&loaded), dump_all(&store));

        // A second save/load cycle stays stable.
        db.save(&loaded).unwrap();
        let again = db.load().unwrap();
        assert_eq!(dump_all(&again), dump_all(&store));
    }

    #[test]
    fn save_leaves_no_guard_or_backups() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.save(&sample_store()).unwrap();

        assert!(!integrity::guard_exists(dir.path()));
        for name in ["buckets~", "checksum~", "_~", "_extra~"] {
            assert!(!dir.path().join(name).exists(), "{name} left behind");
        }
    }

    #[test]
    fn tampered_bucket_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.save(&sample_store()).unwrap();

        let victim = dir.path().join("_extra");
        fs::write(&victim, "app;alice;gps;0xFFFF;\nextra;line;here;0x0;\n").unwrap();

        assert!(matches!(db.load(), Err(StorageError::Corrupted { .. })));
    }

    #[test]
    fn missing_bucket_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.save(&sample_store()).unwrap();
        fs::remove_file(dir.path().join("_extra")).unwrap();
        assert!(db.load().is_err());
    }

    #[test]
    fn crash_before_rename_recovers_new_state_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let old_store = PolicyStore::new();
        db.save(&old_store).unwrap();

        // Simulate the crash window: new state written to backups, guard
        // created, renames never ran.
        let new_store = sample_store();
        db.write_backup(INDEX_FILE, format::serialize_index(new_store.buckets()).as_bytes())
            .unwrap();
        let mut checksums = ChecksumSet::new();
        checksums.record(
            INDEX_FILE,
            crate::checksum::digest(format::serialize_index(new_store.buckets()).as_bytes()),
        );
        for bucket in new_store.buckets() {
            let name = format::bucket_file_name(bucket.id());
            let bytes = format::serialize_bucket(bucket);
            db.write_backup(&name, bytes.as_bytes()).unwrap();
            checksums.record(name, crate::checksum::digest(bytes.as_bytes()));
        }
        db.write_backup(CHECKSUM_FILE, checksums.to_file_content().as_bytes())
            .unwrap();
        integrity::create_guard(dir.path()).unwrap();

        // Restart.
        let loaded = db.load().unwrap();
        assert_eq!(dump_all(&loaded), dump_all(&new_store));
        assert!(!integrity::guard_exists(dir.path()));
        assert!(!dir.path().join("buckets~").exists());
        assert!(!dir.path().join("checksum~").exists());
        // The promoted primaries verify cleanly on the next load.
        let again = db.load().unwrap();
        assert_eq!(dump_all(&again), dump_all(&new_store));
    }

    #[test]
    fn crash_mid_rename_still_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let store = sample_store();
        db.save(&store).unwrap();

        // Re-create the window with some renames already done: move the
        // primaries back to ~ for half the files only.
        let index_bytes = fs::read(dir.path().join(INDEX_FILE)).unwrap();
        fs::write(dir.path().join("buckets~"), &index_bytes).unwrap();
        integrity::create_guard(dir.path()).unwrap();

        let loaded = db.load().unwrap();
        assert_eq!(dump_all(&loaded), dump_all(&store));
        assert!(!integrity::guard_exists(dir.path()));
    }

    #[test]
    fn load_drops_files_no_bucket_references() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.save(&sample_store()).unwrap();
        fs::write(dir.path().join("_ghost"), "").unwrap();

        db.load().unwrap();
        assert!(!dir.path().join("_ghost").exists());
    }

    #[test]
    fn deleted_bucket_file_disappears_after_next_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let mut store = sample_store();
        db.save(&store).unwrap();
        assert!(dir.path().join("_extra").exists());

        store.delete_bucket("extra").unwrap();
        db.save(&store).unwrap();
        db.load().unwrap();
        assert!(!dir.path().join("_extra").exists());
    }

    #[test]
    fn second_open_fails_on_lock() {
        let dir = tempfile::tempdir().unwrap();
        let _db = Database::open(dir.path()).unwrap();
        assert!(matches!(
            Database::open(dir.path()),
            Err(StorageError::LockBusy { .. })
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _db = Database::open(dir.path()).unwrap();
        }
        assert!(Database::open(dir.path()).is_ok());
    }
}
