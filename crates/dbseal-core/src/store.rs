use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{MasterKey, StoreError};

/// Result of rotating a single database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// A sealed file was re-encrypted under the new key.
    Rotated,
    /// A legacy plaintext file was sealed for the first time under the new key.
    Migrated,
    /// Nothing exists at the path yet.
    Absent,
}

/// Per-path results of a multi-database rotation.
pub type RotationReport = BTreeMap<PathBuf, Result<RotationOutcome, StoreError>>;

/// Contract for transparent at-rest encryption of file-backed databases.
///
/// Collaborators only ever see the handle type; derived keys, tokens and
/// working-copy locations stay behind this boundary. All calls block.
pub trait EncryptedStore: Send + Sync {
    /// Connection to the plaintext working copy, exclusively owned by the caller.
    type Handle;

    /// Decrypt (or adopt) the file at `path` and return a working connection.
    fn open(&self, path: &Path) -> Result<Self::Handle, StoreError>;

    /// Close the connection; when `seal` is set, encrypt and atomically replace
    /// the file at the original path.
    fn close(&self, handle: Self::Handle, seal: bool) -> Result<(), StoreError>;

    /// Re-encrypt a closed database under a key derived from `new_master_key`.
    fn rotate(
        &self,
        path: &Path,
        new_master_key: MasterKey,
    ) -> Result<RotationOutcome, StoreError>;

    /// Rotate each path independently, reporting every result.
    fn rotate_all(&self, paths: &[PathBuf], new_master_key: MasterKey) -> RotationReport;
}
