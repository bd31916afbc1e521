use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use dbseal_core::{EncryptedStore, MasterKey, RotationOutcome, RotationReport, StoreError};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    codec::{self, CodecError, TokenHeader},
    file_state::{self, DatabaseRecord, FileStatus, OnDisk, Origin},
    kdf::{self, KdfParams},
};

/// Tunables for a manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub kdf: KdfParams,
    /// Run `VACUUM` on the working copy before sealing.
    pub compact_on_close: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            compact_on_close: true,
        }
    }
}

/// Current master key plus the one it replaced, kept so an interrupted
/// multi-file rotation can be resumed. `generation` counts adoptions.
struct KeyState {
    current: MasterKey,
    retired: Option<MasterKey>,
    generation: u64,
}

type Slot = Arc<Mutex<Option<DatabaseRecord>>>;

/// Plaintext working connection returned by [`EncryptedStoreManager::open`].
/// Derefs to the underlying SQLite connection; hand it back to
/// [`EncryptedStoreManager::close`] to seal the changes.
#[derive(Debug)]
pub struct DatabaseHandle {
    conn: Connection,
    path: PathBuf,
    dirty: bool,
}

impl DatabaseHandle {
    /// The sealed file this connection belongs to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Force sealing on close even if the working copy looks unchanged.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Deref for DatabaseHandle {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for DatabaseHandle {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Orchestrates open/close/rotate for any number of encrypted database files
/// sharing one master key. Operations on one path are serialized; distinct
/// paths proceed in parallel.
pub struct EncryptedStoreManager {
    settings: StoreSettings,
    keys: RwLock<KeyState>,
    // Entries are never removed so every caller for a path shares one lock.
    slots: Mutex<HashMap<PathBuf, Slot>>,
    #[cfg(test)]
    fail_before_swap: AtomicBool,
}

impl EncryptedStoreManager {
    pub fn new(master_key: MasterKey, settings: StoreSettings) -> Result<Self, StoreError> {
        if master_key.is_empty() {
            return Err(StoreError::configuration("master key must not be empty"));
        }
        settings.kdf.validate()?;
        info!(
            iterations = settings.kdf.iterations,
            compact_on_close = settings.compact_on_close,
            "encrypted store manager initialized"
        );
        Ok(Self {
            settings,
            keys: RwLock::new(KeyState {
                current: master_key,
                retired: None,
                generation: 0,
            }),
            slots: Mutex::new(HashMap::new()),
            #[cfg(test)]
            fail_before_swap: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Decrypt (or adopt) the database at `path` into its working copy and
    /// connect to it.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(&self, path: &Path) -> Result<DatabaseHandle, StoreError> {
        let path = normalize(path)?;
        let slot = self.slot(&path)?;
        let mut guard = lock(&slot)?;
        self.open_locked(&path, &mut guard)
            .inspect_err(|err| log_failure("open", &path, err))
    }

    /// Close the connection. With `seal`, encrypt the working copy and swap it
    /// over the original path; otherwise leave the plaintext copy in place.
    #[instrument(skip_all, fields(path = %handle.path.display(), seal = seal))]
    pub fn close(&self, handle: DatabaseHandle, seal: bool) -> Result<(), StoreError> {
        let DatabaseHandle { conn, path, dirty } = handle;
        let slot = self.slot(&path)?;
        let mut guard = lock(&slot)?;
        self.close_locked(conn, &path, dirty, seal, &mut guard)
            .inspect_err(|err| log_failure("close", &path, err))
    }

    /// Retry sealing a database whose previous close failed to seal.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn retry_seal(&self, path: &Path) -> Result<(), StoreError> {
        let path = normalize(path)?;
        let slot = self.slot(&path)?;
        let mut guard = lock(&slot)?;
        let result = match guard.as_mut() {
            Some(record) if !record.is_open => self.seal_record(record),
            Some(_) => Err(StoreError::AlreadyOpen { path: path.clone() }),
            None => Err(StoreError::NotOpen { path: path.clone() }),
        };
        finish_seal(result, &mut guard)
            .inspect_err(|err| log_failure("retry_seal", &path, err))
    }

    /// Re-encrypt the closed database at `path` under `new_master_key`, then
    /// adopt that key as current.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn rotate(
        &self,
        path: &Path,
        new_master_key: MasterKey,
    ) -> Result<RotationOutcome, StoreError> {
        if new_master_key.is_empty() {
            return Err(StoreError::configuration("new master key must not be empty"));
        }
        let candidates = self.decrypt_candidates()?;
        let outcome = self.rotate_path(path, &candidates, &new_master_key)?;
        self.adopt_key(new_master_key)?;
        Ok(outcome)
    }

    /// Rotate every path independently. The new key is adopted unless every
    /// path failed; failed paths stay under the old key, which remains
    /// available to a later `rotate` of that path.
    #[instrument(skip_all, fields(count = paths.len()))]
    pub fn rotate_all(&self, paths: &[PathBuf], new_master_key: MasterKey) -> RotationReport {
        let mut report = BTreeMap::new();
        if new_master_key.is_empty() {
            for path in paths {
                report.insert(
                    path.clone(),
                    Err(StoreError::configuration("new master key must not be empty")),
                );
            }
            return report;
        }

        let candidates = match self.decrypt_candidates() {
            Ok(candidates) => candidates,
            Err(err) => {
                for path in paths {
                    let reason = err.to_string();
                    report.insert(path.clone(), Err(StoreError::Lock { reason }));
                }
                return report;
            }
        };

        let mut seen = HashSet::new();
        for path in paths {
            if let Ok(normalized) = normalize(path) {
                if !seen.insert(normalized) {
                    debug!(path = %path.display(), "skipping repeated path");
                    continue;
                }
            }
            let result = self.rotate_path(path, &candidates, &new_master_key);
            report.insert(path.clone(), result);
        }

        let succeeded = report.values().filter(|r| r.is_ok()).count();
        if paths.is_empty() || succeeded > 0 {
            if let Err(err) = self.adopt_key(new_master_key) {
                error!("failed to adopt rotated key: {err}");
            }
        }
        info!(
            succeeded,
            failed = report.len() - succeeded,
            "rotation finished"
        );
        report
    }

    /// Open, run `f`, and always close with sealing. An error from `f` wins
    /// over a close error.
    pub fn with_database<T, E, F>(&self, path: &Path, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut DatabaseHandle) -> Result<T, E>,
    {
        let mut handle = self.open(path)?;
        let outcome = f(&mut handle);
        let closed = self.close(handle, true);
        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), _) => Err(err),
        }
    }

    /// Describe the file at `path` without decrypting it.
    pub fn inspect(&self, path: &Path) -> Result<FileStatus, StoreError> {
        file_state::inspect(&normalize(path)?)
    }

    /// Paths with a live or pending-seal working copy.
    pub fn active_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let slots: Vec<Slot> = lock(&self.slots)?.values().cloned().collect();
        let mut active = Vec::new();
        for slot in slots {
            if let Some(record) = lock(&slot)?.as_ref() {
                active.push(record.path.clone());
            }
        }
        active.sort();
        Ok(active)
    }

    fn open_locked(
        &self,
        path: &Path,
        slot: &mut Option<DatabaseRecord>,
    ) -> Result<DatabaseHandle, StoreError> {
        if let Some(record) = slot.as_mut() {
            if record.is_open {
                return Err(StoreError::AlreadyOpen {
                    path: path.to_path_buf(),
                });
            }
            info!("reopening working copy pending seal");
            let conn = connect(path, &record.temp_path)?;
            record.is_open = true;
            return Ok(DatabaseHandle {
                conn,
                path: path.to_path_buf(),
                dirty: false,
            });
        }

        file_state::ensure_parent(path)?;
        let temp_path = file_state::working_path_for(path)?;
        let (master, generation) = self.current_key()?;
        let origin = if temp_path.exists() {
            warn!(
                temp = %temp_path.display(),
                "adopting orphaned working copy; it will be sealed on close"
            );
            Origin::Orphan
        } else {
            match file_state::read_on_disk(path)? {
                OnDisk::Absent => {
                    debug!("no file on disk; starting empty working copy");
                    Origin::Absent
                }
                OnDisk::Sealed(token) => {
                    let plaintext = codec::open_with_master(&token, &master)
                        .map_err(|e| integrity_error(path, e))?;
                    file_state::write_working_copy(&temp_path, &plaintext)?;
                    debug!(bytes = plaintext.len(), "decrypted into working copy");
                    Origin::Sealed
                }
                OnDisk::Plaintext(bytes) => {
                    warn!("file is not sealed; trusting it as plaintext for first-run migration");
                    file_state::write_working_copy(&temp_path, &bytes)?;
                    Origin::Plaintext
                }
            }
        };

        let baseline = file_state::digest_file(&temp_path)?;
        let conn = match connect(path, &temp_path) {
            Ok(conn) => conn,
            Err(err) => {
                if origin != Origin::Orphan {
                    file_state::remove_working_copy(&temp_path)?;
                }
                return Err(err);
            }
        };

        *slot = Some(DatabaseRecord::new(
            path.to_path_buf(),
            temp_path,
            origin,
            generation,
            baseline,
        ));
        info!(?origin, "opened encrypted database");
        Ok(DatabaseHandle {
            conn,
            path: path.to_path_buf(),
            dirty: false,
        })
    }

    fn close_locked(
        &self,
        conn: Connection,
        path: &Path,
        handle_dirty: bool,
        seal: bool,
        slot: &mut Option<DatabaseRecord>,
    ) -> Result<(), StoreError> {
        let record = match slot.as_mut() {
            Some(record) if record.is_open => record,
            _ => {
                return Err(StoreError::NotOpen {
                    path: path.to_path_buf(),
                })
            }
        };

        record.is_open = false;
        record.dirty |= handle_dirty;
        conn.close().map_err(|(_, e)| StoreError::Engine {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if !seal {
            warn!(
                temp = %record.temp_path.display(),
                "closed without sealing; plaintext working copy left on disk"
            );
            *slot = None;
            return Ok(());
        }

        let result = self.seal_record(record);
        finish_seal(result, slot)
    }

    /// Encrypt the working copy and swap it over the sealed path. On failure
    /// the working copy and record stay in place for a retry.
    fn seal_record(&self, record: &mut DatabaseRecord) -> Result<(), StoreError> {
        let (master, generation) = self.current_key()?;
        record.refresh_dirty()?;
        if !record.needs_seal(generation) {
            info!("working copy unchanged; sealed file left as is");
            return file_state::remove_working_copy(&record.temp_path);
        }
        if !record.dirty && record.origin == Origin::Sealed {
            info!("master key rotated while open; resealing under the current key");
        }

        if self.settings.compact_on_close {
            compact(&record.temp_path);
        }

        let plaintext = file_state::read_working_copy(&record.temp_path)?;
        let sealed_len = self
            .seal_bytes(&plaintext, &master)
            .and_then(|token| self.swap_in(&record.path, &token).map(|()| token.len()))
            .map_err(|err| StoreError::Seal {
                path: record.path.clone(),
                reason: err.to_string(),
            })?;

        info!(bytes = sealed_len, "sealed database");
        file_state::remove_working_copy(&record.temp_path)
    }

    fn rotate_path(
        &self,
        path: &Path,
        candidates: &[MasterKey],
        new_master_key: &MasterKey,
    ) -> Result<RotationOutcome, StoreError> {
        let path = normalize(path)?;
        let slot = self.slot(&path)?;
        let guard = lock(&slot)?;
        if guard.is_some() {
            let err = StoreError::Rotation {
                path: path.clone(),
                reason: "database is open or pending seal".into(),
            };
            log_failure("rotate", &path, &err);
            return Err(err);
        }

        let result = self.rotate_locked(&path, candidates, new_master_key);
        match &result {
            Ok(outcome) => info!(path = %path.display(), ?outcome, "rotated database"),
            Err(err) => log_failure("rotate", &path, err),
        }
        result
    }

    fn rotate_locked(
        &self,
        path: &Path,
        candidates: &[MasterKey],
        new_master_key: &MasterKey,
    ) -> Result<RotationOutcome, StoreError> {
        let (plaintext, outcome) = match file_state::read_on_disk(path)? {
            OnDisk::Absent => return Ok(RotationOutcome::Absent),
            OnDisk::Sealed(token) => match decrypt_any(path, &token, candidates) {
                Ok(plaintext) => (plaintext, RotationOutcome::Rotated),
                Err(err) => {
                    // A repeated or resumed rotation finds the file already moved.
                    if decrypt_any(path, &token, std::slice::from_ref(new_master_key)).is_ok() {
                        debug!("already sealed under the new key");
                        return Ok(RotationOutcome::Rotated);
                    }
                    return Err(err);
                }
            },
            OnDisk::Plaintext(bytes) => {
                warn!("file is not sealed; sealing it under the new key");
                (bytes, RotationOutcome::Migrated)
            }
        };

        self.seal_bytes(&plaintext, new_master_key)
            .and_then(|token| self.swap_in(path, &token))
            .map_err(|err| StoreError::Rotation {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        Ok(outcome)
    }

    fn seal_bytes(&self, plaintext: &[u8], master: &MasterKey) -> Result<Vec<u8>, StoreError> {
        let key = kdf::derive_fresh(master, &self.settings.kdf)?;
        codec::seal(plaintext, &key).map_err(|e| StoreError::configuration(e.to_string()))
    }

    fn swap_in(&self, path: &Path, token: &[u8]) -> Result<(), StoreError> {
        #[cfg(test)]
        if self.fail_before_swap.load(Ordering::SeqCst) {
            return Err(StoreError::io(
                path,
                std::io::Error::other("injected failure before swap"),
            ));
        }
        file_state::persist_atomically(path, token)
    }

    fn current_key(&self) -> Result<(MasterKey, u64), StoreError> {
        let keys = self.keys.read().map_err(|e| StoreError::Lock {
            reason: e.to_string(),
        })?;
        Ok((keys.current.clone(), keys.generation))
    }

    fn decrypt_candidates(&self) -> Result<Vec<MasterKey>, StoreError> {
        let keys = self.keys.read().map_err(|e| StoreError::Lock {
            reason: e.to_string(),
        })?;
        let mut candidates = vec![keys.current.clone()];
        candidates.extend(keys.retired.iter().cloned());
        Ok(candidates)
    }

    fn adopt_key(&self, new_master_key: MasterKey) -> Result<(), StoreError> {
        let mut keys = self.keys.write().map_err(|e| StoreError::Lock {
            reason: e.to_string(),
        })?;
        if keys.current != new_master_key {
            let previous = std::mem::replace(&mut keys.current, new_master_key);
            keys.retired = Some(previous);
            keys.generation += 1;
            info!(generation = keys.generation, "adopted new master key");
        }
        Ok(())
    }

    fn slot(&self, path: &Path) -> Result<Slot, StoreError> {
        let mut slots = lock(&self.slots)?;
        Ok(slots.entry(path.to_path_buf()).or_default().clone())
    }

    #[cfg(test)]
    fn inject_swap_failure(&self, enabled: bool) {
        self.fail_before_swap.store(enabled, Ordering::SeqCst);
    }
}

impl EncryptedStore for EncryptedStoreManager {
    type Handle = DatabaseHandle;

    fn open(&self, path: &Path) -> Result<DatabaseHandle, StoreError> {
        EncryptedStoreManager::open(self, path)
    }

    fn close(&self, handle: DatabaseHandle, seal: bool) -> Result<(), StoreError> {
        EncryptedStoreManager::close(self, handle, seal)
    }

    fn rotate(
        &self,
        path: &Path,
        new_master_key: MasterKey,
    ) -> Result<RotationOutcome, StoreError> {
        EncryptedStoreManager::rotate(self, path, new_master_key)
    }

    fn rotate_all(&self, paths: &[PathBuf], new_master_key: MasterKey) -> RotationReport {
        EncryptedStoreManager::rotate_all(self, paths, new_master_key)
    }
}

fn finish_seal(
    result: Result<(), StoreError>,
    slot: &mut Option<DatabaseRecord>,
) -> Result<(), StoreError> {
    match result {
        Ok(()) => {
            *slot = None;
            Ok(())
        }
        Err(err) => {
            // Keep the record while a working copy exists so retry_seal/open can use it.
            if slot.as_ref().is_some_and(|r| !r.temp_path.exists()) {
                *slot = None;
            }
            Err(err)
        }
    }
}

fn decrypt_any(
    path: &Path,
    token: &[u8],
    candidates: &[MasterKey],
) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    let header = TokenHeader::parse(token).map_err(|e| integrity_error(path, e))?;
    for master in candidates {
        let key = kdf::derive(master, &header.salt, header.iterations)?;
        if let Ok(plaintext) = codec::open(token, &key) {
            return Ok(plaintext);
        }
    }
    Err(integrity_error(path, CodecError::Authentication))
}

fn connect(path: &Path, temp_path: &Path) -> Result<Connection, StoreError> {
    Connection::open(temp_path).map_err(|e| StoreError::Engine {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Reclaim free pages so deleted rows do not linger in the ciphertext.
/// Legacy files may not be SQLite databases, so failure only warns.
fn compact(temp_path: &Path) {
    if !temp_path.exists() {
        return;
    }
    let result = Connection::open(temp_path).and_then(|conn| {
        conn.execute_batch("VACUUM")?;
        conn.close().map_err(|(_, e)| e)
    });
    if let Err(err) = result {
        warn!("compaction skipped: {err}");
    }
}

fn normalize(path: &Path) -> Result<PathBuf, StoreError> {
    std::path::absolute(path).map_err(|e| StoreError::io(path, e))
}

fn integrity_error(path: &Path, err: CodecError) -> StoreError {
    StoreError::Integrity {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex.lock().map_err(|e| StoreError::Lock {
        reason: e.to_string(),
    })
}

fn log_failure(operation: &str, path: &Path, err: &StoreError) {
    match err {
        StoreError::Integrity { .. } => {
            error!(operation, path = %path.display(), kind = %err.kind(), "{err}")
        }
        _ => warn!(operation, path = %path.display(), kind = %err.kind(), "{err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, fs, thread};

    use dbseal_core::ErrorKind;
    use rusqlite::params;

    use super::*;

    fn settings() -> StoreSettings {
        StoreSettings {
            kdf: KdfParams { iterations: 16 },
            compact_on_close: true,
        }
    }

    fn manager(pass: &str) -> EncryptedStoreManager {
        EncryptedStoreManager::new(MasterKey::from_passphrase(pass), settings()).expect("manager")
    }

    fn write_row(handle: &DatabaseHandle, id: i64, val: &str) {
        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY, val TEXT NOT NULL)",
                [],
            )
            .expect("create");
        handle
            .execute("INSERT INTO items (id, val) VALUES (?1, ?2)", params![id, val])
            .expect("insert");
    }

    fn read_val(handle: &DatabaseHandle, id: i64) -> String {
        handle
            .query_row("SELECT val FROM items WHERE id = ?1", params![id], |row| row.get(0))
            .expect("select")
    }

    fn seed(store: &EncryptedStoreManager, path: &Path, val: &str) {
        let handle = store.open(path).expect("open");
        write_row(&handle, 1, val);
        store.close(handle, true).expect("close");
    }

    fn working_copy(path: &Path) -> PathBuf {
        file_state::working_path_for(path).expect("working path")
    }

    #[test]
    fn open_write_close_reopen_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db1");
        let store = manager("alpha");

        let handle = store.open(&path).expect("open");
        assert_eq!(handle.path(), path.as_path());
        write_row(&handle, 1, "a");
        store.close(handle, true).expect("close");

        let on_disk = fs::read(&path).expect("read sealed");
        assert!(codec::looks_sealed(&on_disk));
        assert!(!on_disk.windows(5).any(|w| w == b"items"));
        assert!(!working_copy(&path).exists());
        assert!(store.active_paths().expect("active").is_empty());

        let handle = store.open(&path).expect("reopen");
        assert_eq!(read_val(&handle, 1), "a");
        store.close(handle, true).expect("close");
    }

    #[test]
    fn legacy_plaintext_is_migrated_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("legacy.bin");
        let original = b"not a database, just legacy bytes \x00\x01".to_vec();
        fs::write(&path, &original).expect("write legacy");
        let store = manager("alpha");

        let handle = store.open(&path).expect("open legacy");
        assert_eq!(fs::read(working_copy(&path)).expect("working copy"), original);
        store.close(handle, true).expect("close");

        let token = fs::read(&path).expect("read sealed");
        assert!(codec::looks_sealed(&token));
        let opened =
            codec::open_with_master(&token, &MasterKey::from_passphrase("alpha")).expect("open");
        assert_eq!(opened.as_slice(), original.as_slice());
    }

    #[test]
    fn wrong_key_fails_closed_without_working_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        seed(&manager("alpha"), &path, "secret");

        let err = manager("beta").open(&path).expect_err("wrong key");
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!err.is_retryable());
        assert!(!working_copy(&path).exists());
    }

    #[test]
    fn tampered_file_is_rejected_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "secret");

        let mut token = fs::read(&path).expect("read");
        let last = token.len() - 1;
        token[last] ^= 0x80;
        fs::write(&path, &token).expect("write tampered");

        let err = store.open(&path).expect_err("tampered");
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn unchanged_database_is_not_resealed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "a");
        let before = fs::read(&path).expect("read");

        let handle = store.open(&path).expect("open");
        assert_eq!(read_val(&handle, 1), "a");
        store.close(handle, true).expect("close");
        assert_eq!(fs::read(&path).expect("read"), before);

        let mut handle = store.open(&path).expect("open");
        handle.mark_dirty();
        store.close(handle, true).expect("close");
        assert_ne!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn failed_seal_keeps_working_copy_and_sealed_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "old");
        let before = fs::read(&path).expect("read");

        let handle = store.open(&path).expect("open");
        handle
            .execute("UPDATE items SET val = 'new' WHERE id = 1", [])
            .expect("update");
        store.inject_swap_failure(true);
        let err = store.close(handle, true).expect_err("seal must fail");
        assert_eq!(err.kind(), ErrorKind::Seal);
        assert!(err.is_retryable());

        // The final path never held anything but the previous token.
        assert_eq!(fs::read(&path).expect("read"), before);
        assert!(working_copy(&path).exists());
        assert_eq!(store.active_paths().expect("active"), vec![path.clone()]);

        store.inject_swap_failure(false);
        store.retry_seal(&path).expect("retry");
        assert!(!working_copy(&path).exists());
        assert!(store.active_paths().expect("active").is_empty());

        let handle = store.open(&path).expect("reopen");
        assert_eq!(read_val(&handle, 1), "new");
        store.close(handle, true).expect("close");
    }

    #[test]
    fn pending_seal_can_be_reopened_without_decrypting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");

        let handle = store.open(&path).expect("open");
        write_row(&handle, 7, "pending");
        store.inject_swap_failure(true);
        store.close(handle, true).expect_err("seal must fail");
        assert!(!path.exists());

        store.inject_swap_failure(false);
        let handle = store.open(&path).expect("reopen pending");
        assert_eq!(read_val(&handle, 7), "pending");
        store.close(handle, true).expect("close");
        assert!(codec::looks_sealed(&fs::read(&path).expect("read")));
    }

    #[test]
    fn second_open_of_same_path_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");

        let handle = store.open(&path).expect("open");
        let err = store.open(&path).expect_err("already open");
        assert_eq!(err.kind(), ErrorKind::AlreadyOpen);
        store.close(handle, true).expect("close");

        let err = store.retry_seal(&path).expect_err("nothing pending");
        assert_eq!(err.kind(), ErrorKind::NotOpen);
    }

    #[test]
    fn unsealed_close_leaves_orphan_that_is_adopted_next_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "sealed");

        let handle = store.open(&path).expect("open");
        handle
            .execute("UPDATE items SET val = 'diagnostic' WHERE id = 1", [])
            .expect("update");
        store.close(handle, false).expect("close unsealed");
        assert!(working_copy(&path).exists());
        assert!(store.active_paths().expect("active").is_empty());

        let handle = store.open(&path).expect("adopt orphan");
        assert_eq!(read_val(&handle, 1), "diagnostic");
        store.close(handle, true).expect("close");
        assert!(!working_copy(&path).exists());

        let handle = manager("alpha").open(&path).expect("fresh manager");
        assert_eq!(read_val(&handle, 1), "diagnostic");
    }

    #[test]
    fn rotation_reencrypts_and_adopts_new_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "a");

        let outcome = store
            .rotate(&path, MasterKey::from_passphrase("beta"))
            .expect("rotate");
        assert_eq!(outcome, RotationOutcome::Rotated);

        let handle = store.open(&path).expect("open with adopted key");
        assert_eq!(read_val(&handle, 1), "a");
        store.close(handle, true).expect("close");

        assert_eq!(
            manager("alpha").open(&path).expect_err("old key").kind(),
            ErrorKind::Integrity
        );
        let handle = manager("beta").open(&path).expect("new key");
        assert_eq!(read_val(&handle, 1), "a");
    }

    #[test]
    fn crash_before_rotation_swap_keeps_original_and_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "a");
        let before = fs::read(&path).expect("read");

        store.inject_swap_failure(true);
        let err = store
            .rotate(&path, MasterKey::from_passphrase("beta"))
            .expect_err("rotation must fail");
        assert_eq!(err.kind(), ErrorKind::Rotation);
        assert!(err.is_retryable());
        store.inject_swap_failure(false);

        assert_eq!(fs::read(&path).expect("read"), before);
        let handle = store.open(&path).expect("same manager keeps old key");
        assert_eq!(read_val(&handle, 1), "a");
        store.close(handle, true).expect("close");

        let handle = manager("alpha").open(&path).expect("pre-rotation key");
        assert_eq!(read_val(&handle, 1), "a");
    }

    #[test]
    fn tampered_marker_fails_closed_everywhere() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "secret");

        let mut token = fs::read(&path).expect("read");
        token[codec::MAGIC.len()] = codec::FORMAT_VERSION + 1;
        fs::write(&path, &token).expect("write tampered");

        let err = store.open(&path).expect_err("unknown version");
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!working_copy(&path).exists());
        assert!(matches!(
            store.inspect(&path).expect("inspect"),
            FileStatus::Corrupt { .. }
        ));

        let err = store
            .rotate(&path, MasterKey::from_passphrase("beta"))
            .expect_err("rotate unknown version");
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(fs::read(&path).expect("read"), token);
    }

    #[test]
    fn repeated_paths_rotate_once_and_adopt_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "a");

        let relative_twin = dir.path().join(".").join("db");
        let report = store.rotate_all(
            &[path.clone(), path.clone(), relative_twin],
            MasterKey::from_passphrase("beta"),
        );
        assert_eq!(report.len(), 1);
        assert_eq!(report[&path].as_ref().ok(), Some(&RotationOutcome::Rotated));

        let handle = store.open(&path).expect("same manager follows the new key");
        assert_eq!(read_val(&handle, 1), "a");
        store.close(handle, true).expect("close");
    }

    #[test]
    fn rotating_an_already_rotated_file_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        seed(&manager("alpha"), &path, "a");
        manager("alpha")
            .rotate(&path, MasterKey::from_passphrase("beta"))
            .expect("first rotation");
        let rotated = fs::read(&path).expect("read");

        // A restarted process still holding the old key resumes the same rotation.
        let resumed = manager("alpha");
        let report = resumed.rotate_all(&[path.clone()], MasterKey::from_passphrase("beta"));
        assert_eq!(report[&path].as_ref().ok(), Some(&RotationOutcome::Rotated));
        assert_eq!(fs::read(&path).expect("read"), rotated);

        let handle = resumed.open(&path).expect("adopted beta");
        assert_eq!(read_val(&handle, 1), "a");
        resumed.close(handle, true).expect("close");
    }

    #[test]
    fn clean_close_after_rotation_reseals_under_current_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        let store = manager("alpha");
        seed(&store, &a, "one");
        seed(&store, &b, "two");

        let held = store.open(&b).expect("open b");
        let report = store.rotate_all(&[a.clone(), b.clone()], MasterKey::from_passphrase("beta"));
        assert_eq!(report[&a].as_ref().ok(), Some(&RotationOutcome::Rotated));
        assert_eq!(
            report[&b].as_ref().expect_err("b is open").kind(),
            ErrorKind::Rotation
        );

        // No writes, but the key changed underneath the handle.
        store.close(held, true).expect("close b");
        let beta = manager("beta");
        let handle = beta.open(&b).expect("b under beta");
        assert_eq!(read_val(&handle, 1), "two");
        beta.close(handle, true).expect("close");

        store
            .rotate(&a, MasterKey::from_passphrase("gamma"))
            .expect("rotate a to gamma");
        store
            .rotate(&b, MasterKey::from_passphrase("gamma"))
            .expect("rotate b to gamma");
        let gamma = manager("gamma");
        for (path, val) in [(&a, "one"), (&b, "two")] {
            let handle = gamma.open(path).expect("gamma");
            assert_eq!(read_val(&handle, 1), val);
            gamma.close(handle, true).expect("close");
        }
    }

    #[test]
    fn readers_only_ever_see_complete_tokens_during_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        seed(&store, &path, "v0");
        let mut written = HashSet::from([fs::read(&path).expect("read")]);

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let path = path.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seen = HashSet::new();
                loop {
                    seen.insert(fs::read(&path).expect("sealed path must always exist"));
                    if stop.load(Ordering::SeqCst) {
                        break seen;
                    }
                }
            })
        };

        for i in 1..=8 {
            let handle = store.open(&path).expect("open");
            handle
                .execute(
                    "UPDATE items SET val = ?1 WHERE id = 1",
                    params![format!("v{i}")],
                )
                .expect("update");
            store.close(handle, true).expect("close");
            written.insert(fs::read(&path).expect("read"));
        }
        stop.store(true, Ordering::SeqCst);
        let seen = reader.join().expect("reader");

        assert!(!seen.is_empty());
        for bytes in &seen {
            assert!(codec::looks_sealed(bytes));
            assert!(written.contains(bytes), "observed a token that was never sealed");
        }
    }

    #[test]
    fn rotating_an_open_database_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        let handle = store.open(&path).expect("open");

        let err = store
            .rotate(&path, MasterKey::from_passphrase("beta"))
            .expect_err("open database");
        assert_eq!(err.kind(), ErrorKind::Rotation);
        store.close(handle, true).expect("close");

        // The refused rotation left the current key in place.
        let handle = store.open(&path).expect("reopen");
        store.close(handle, true).expect("close");
    }

    #[test]
    fn rotate_all_reports_each_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sealed = dir.path().join("sealed.db");
        let legacy = dir.path().join("legacy.db");
        let absent = dir.path().join("absent.db");
        let corrupt = dir.path().join("corrupt.db");
        let store = manager("alpha");
        seed(&store, &sealed, "a");
        fs::write(&legacy, b"legacy bytes").expect("write legacy");
        let mut broken = fs::read(&sealed).expect("read");
        let last = broken.len() - 1;
        broken[last] ^= 0x01;
        fs::write(&corrupt, &broken).expect("write corrupt");

        let paths = vec![sealed.clone(), legacy.clone(), absent.clone(), corrupt.clone()];
        let report = store.rotate_all(&paths, MasterKey::from_passphrase("beta"));

        assert_eq!(report.len(), 4);
        assert_eq!(report[&sealed].as_ref().ok(), Some(&RotationOutcome::Rotated));
        assert_eq!(report[&legacy].as_ref().ok(), Some(&RotationOutcome::Migrated));
        assert_eq!(report[&absent].as_ref().ok(), Some(&RotationOutcome::Absent));
        let err = report[&corrupt].as_ref().expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(fs::read(&corrupt).expect("read"), broken);

        let beta = manager("beta");
        let handle = beta.open(&sealed).expect("sealed under beta");
        assert_eq!(read_val(&handle, 1), "a");
        beta.close(handle, true).expect("close");
        let token = fs::read(&legacy).expect("read");
        let opened =
            codec::open_with_master(&token, &MasterKey::from_passphrase("beta")).expect("open");
        assert_eq!(opened.as_slice(), b"legacy bytes");
    }

    #[test]
    fn later_rotation_falls_back_to_retired_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("first.db");
        let second = dir.path().join("second.db");
        let store = manager("alpha");
        seed(&store, &first, "one");
        seed(&store, &second, "two");

        store
            .rotate(&first, MasterKey::from_passphrase("beta"))
            .expect("rotate first");
        // second is still under alpha, which is now the retired key.
        assert_eq!(
            store.open(&second).expect_err("current key only").kind(),
            ErrorKind::Integrity
        );
        let outcome = store
            .rotate(&second, MasterKey::from_passphrase("beta"))
            .expect("rotate second");
        assert_eq!(outcome, RotationOutcome::Rotated);

        let handle = manager("beta").open(&second).expect("beta");
        assert_eq!(read_val(&handle, 1), "two");
    }

    #[test]
    fn each_open_uses_key_current_at_its_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");

        seed(&store, &path, "before");
        store
            .rotate(&path, MasterKey::from_passphrase("beta"))
            .expect("rotate");

        let handle = store.open(&path).expect("open after rotation");
        write_row(&handle, 2, "after");
        store.close(handle, true).expect("close");

        let handle = manager("beta").open(&path).expect("beta");
        assert_eq!(read_val(&handle, 1), "before");
        assert_eq!(read_val(&handle, 2), "after");
    }

    #[test]
    fn distinct_paths_work_in_parallel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(manager("alpha"));

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                let path = dir.path().join(format!("db{i}"));
                thread::spawn(move || {
                    let handle = store.open(&path).expect("open");
                    write_row(&handle, i, &format!("value-{i}"));
                    store.close(handle, true).expect("close");
                    path
                })
            })
            .collect();

        for (i, worker) in workers.into_iter().enumerate() {
            let path = worker.join().expect("join");
            let handle = store.open(&path).expect("reopen");
            assert_eq!(read_val(&handle, i as i64), format!("value-{i}"));
            store.close(handle, true).expect("close");
        }
    }

    #[test]
    fn with_database_always_seals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");

        let count: i64 = store
            .with_database(&path, |db| -> Result<i64, Box<dyn std::error::Error>> {
                write_row(db, 1, "a");
                Ok(db.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?)
            })
            .expect("scoped use");
        assert_eq!(count, 1);
        assert!(codec::looks_sealed(&fs::read(&path).expect("read")));

        let failed = store.with_database(&path, |db| -> Result<(), Box<dyn std::error::Error>> {
            db.execute("INSERT INTO items (id, val) VALUES (2, 'b')", [])?;
            Err("caller failure".into())
        });
        assert!(failed.is_err());
        assert!(!working_copy(&path).exists());
    }

    #[test]
    fn works_through_the_store_contract() {
        fn store_and_load<S>(store: &S, path: &Path) -> String
        where
            S: EncryptedStore<Handle = DatabaseHandle>,
        {
            let handle = store.open(path).expect("open");
            write_row(&handle, 1, "via trait");
            store.close(handle, true).expect("close");
            let handle = store.open(path).expect("reopen");
            let val = read_val(&handle, 1);
            store.close(handle, true).expect("close");
            val
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let store = manager("alpha");
        assert_eq!(store_and_load(&store, &dir.path().join("db")), "via trait");
    }

    #[test]
    fn rejects_invalid_configuration() {
        let err = EncryptedStoreManager::new(MasterKey::new(Vec::new()), settings())
            .err()
            .expect("empty key");
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let bad = StoreSettings {
            kdf: KdfParams { iterations: 0 },
            compact_on_close: false,
        };
        let err = EncryptedStoreManager::new(MasterKey::from_passphrase("k"), bad)
            .err()
            .expect("zero iterations");
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let report =
            manager("alpha").rotate_all(&[PathBuf::from("x")], MasterKey::new(Vec::new()));
        assert!(report.values().all(|r| r.is_err()));
    }

    #[test]
    fn inspect_reports_header_without_decrypting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let store = manager("alpha");
        assert_eq!(store.inspect(&path).expect("inspect"), FileStatus::Absent);
        seed(&store, &path, "a");
        assert!(matches!(
            manager("wrong").inspect(&path).expect("inspect"),
            FileStatus::Sealed { iterations: 16, .. }
        ));
    }
}
