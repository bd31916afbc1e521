//! Per-path working-copy bookkeeping and the filesystem primitives the manager
//! builds on: classification of on-disk files, working-copy placement and the
//! write-then-rename swap.

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use dbseal_core::StoreError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::codec::{self, TokenHeader};

/// SQLite side files that may accompany a working copy.
const ENGINE_SIDE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

pub type FileDigest = [u8; 32];

/// Lifecycle of one logical database path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Absent,
    PlaintextWorking { dirty: bool },
    SealedOnDisk,
}

/// Where the working copy's initial content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Nothing on disk; the engine creates the working copy.
    Absent,
    /// Decrypted from a sealed file.
    Sealed,
    /// Copied verbatim from an unsealed legacy file.
    Plaintext,
    /// Left behind by an earlier process or an unsealed close.
    Orphan,
}

/// Live bookkeeping for one open (or pending-seal) database.
#[derive(Debug, Clone)]
pub struct DatabaseRecord {
    pub path: PathBuf,
    pub temp_path: PathBuf,
    pub is_open: bool,
    pub dirty: bool,
    pub origin: Origin,
    /// Manager key generation the sealed content was decrypted under.
    pub key_generation: u64,
    baseline: Option<FileDigest>,
}

impl DatabaseRecord {
    pub fn new(
        path: PathBuf,
        temp_path: PathBuf,
        origin: Origin,
        key_generation: u64,
        baseline: Option<FileDigest>,
    ) -> Self {
        Self {
            path,
            temp_path,
            is_open: true,
            // Anything not decrypted from a sealed file must be sealed on close.
            dirty: origin != Origin::Sealed,
            origin,
            key_generation,
            baseline,
        }
    }

    pub fn state(&self) -> FileState {
        if self.is_open || self.temp_path.exists() {
            FileState::PlaintextWorking { dirty: self.dirty }
        } else if self.path.exists() {
            FileState::SealedOnDisk
        } else {
            FileState::Absent
        }
    }

    /// Compare the working copy against its content at open time.
    pub fn refresh_dirty(&mut self) -> Result<bool, StoreError> {
        if !self.dirty {
            self.dirty = digest_file(&self.temp_path)? != self.baseline;
        }
        Ok(self.dirty)
    }

    /// A clean copy of an already sealed file needs no new ciphertext, unless
    /// the key rotated while it was open: the file on disk is then under a
    /// retired key and must move to the current one.
    pub fn needs_seal(&self, current_generation: u64) -> bool {
        self.dirty || self.origin != Origin::Sealed || self.key_generation != current_generation
    }
}

/// Content found at a managed path.
pub enum OnDisk {
    Absent,
    Sealed(Vec<u8>),
    Plaintext(Zeroizing<Vec<u8>>),
}

/// Operator-facing description of a managed file, obtained without decrypting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileStatus {
    Absent,
    Plaintext { len: u64 },
    Sealed { iterations: u32, len: u64 },
    Corrupt { len: u64, reason: String },
}

pub fn read_on_disk(path: &Path) -> Result<OnDisk, StoreError> {
    match fs::read(path) {
        Ok(bytes) if codec::looks_sealed(&bytes) => Ok(OnDisk::Sealed(bytes)),
        Ok(bytes) => Ok(OnDisk::Plaintext(Zeroizing::new(bytes))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(OnDisk::Absent),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

pub fn inspect(path: &Path) -> Result<FileStatus, StoreError> {
    let status = match read_on_disk(path)? {
        OnDisk::Absent => FileStatus::Absent,
        OnDisk::Plaintext(bytes) => FileStatus::Plaintext {
            len: bytes.len() as u64,
        },
        OnDisk::Sealed(token) => match TokenHeader::parse(&token) {
            Ok(header) => FileStatus::Sealed {
                iterations: header.iterations,
                len: token.len() as u64,
            },
            Err(err) => FileStatus::Corrupt {
                len: token.len() as u64,
                reason: err.to_string(),
            },
        },
    };
    Ok(status)
}

/// Hidden sibling used as the plaintext working copy: `dir/.name.tmp`.
pub fn working_path_for(path: &Path) -> Result<PathBuf, StoreError> {
    let name = path.file_name().ok_or_else(|| {
        StoreError::configuration(format!("database path has no file name: {}", path.display()))
    })?;
    let mut hidden = OsString::from(".");
    hidden.push(name);
    hidden.push(".tmp");
    Ok(path.with_file_name(hidden))
}

pub fn ensure_parent(path: &Path) -> Result<&Path, StoreError> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::configuration(format!("invalid storage path: {}", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    Ok(parent)
}

pub fn digest_file(path: &Path) -> Result<Option<FileDigest>, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| StoreError::io(path, e))?;
    Ok(Some(hasher.finalize().into()))
}

pub fn read_working_copy(temp_path: &Path) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    match fs::read(temp_path) {
        Ok(bytes) => Ok(Zeroizing::new(bytes)),
        // The engine never wrote anything: the database is empty.
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Zeroizing::new(Vec::new())),
        Err(err) => Err(StoreError::io(temp_path, err)),
    }
}

/// Write plaintext to the working copy, readable by the owner only.
pub fn write_working_copy(temp_path: &Path, plaintext: &[u8]) -> Result<(), StoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(temp_path)
        .map_err(|e| StoreError::io(temp_path, e))?;
    if let Err(err) = file.write_all(plaintext).and_then(|()| file.sync_all()) {
        // A half-written copy would later be adopted as an orphan.
        drop(file);
        if let Err(cleanup) = fs::remove_file(temp_path) {
            warn!(path = %temp_path.display(), "failed to remove partial working copy: {cleanup}");
        }
        return Err(StoreError::io(temp_path, err));
    }
    Ok(())
}

/// Remove the working copy and any engine side files. Missing files are fine.
pub fn remove_working_copy(temp_path: &Path) -> Result<(), StoreError> {
    remove_if_present(temp_path)?;
    for suffix in ENGINE_SIDE_SUFFIXES {
        let mut side = temp_path.as_os_str().to_owned();
        side.push(suffix);
        remove_if_present(Path::new(&side))?;
    }
    debug!(path = %temp_path.display(), "removed working copy");
    Ok(())
}

/// Replace `path` with `bytes` via a fresh sibling file and a single rename.
/// The previous content stays in place until the new bytes are synced.
pub fn persist_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = ensure_parent(path)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    sync_dir(parent);
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Best effort: the rename is already atomic, this only makes it durable sooner.
    if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), "directory sync failed: {err}");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
