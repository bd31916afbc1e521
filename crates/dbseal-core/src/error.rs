use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Errors produced by the encrypted storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid key-derivation parameters or settings. Never retried.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
    /// A sealed file failed authentication (wrong key, corruption, truncation).
    #[error("integrity check failed for {}: {reason}", path.display())]
    Integrity { path: PathBuf, reason: String },
    /// Filesystem failure while reading, writing or renaming.
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Encrypt-and-swap failed during close; the working copy is preserved.
    #[error("failed to seal {}: {reason}", path.display())]
    Seal { path: PathBuf, reason: String },
    /// Rotation failed; the original file and key are untouched.
    #[error("failed to rotate {}: {reason}", path.display())]
    Rotation { path: PathBuf, reason: String },
    /// The embedded storage engine reported a failure.
    #[error("storage engine error on {}: {reason}", path.display())]
    Engine { path: PathBuf, reason: String },
    /// A live working copy already exists for this path.
    #[error("database already open: {}", path.display())]
    AlreadyOpen { path: PathBuf },
    /// No record is registered for this path.
    #[error("database not open: {}", path.display())]
    NotOpen { path: PathBuf },
    /// Internal lock was poisoned by a panicking thread.
    #[error("lock poisoned: {reason}")]
    Lock { reason: String },
}

/// Stable label for each error class, used in logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Integrity,
    Io,
    Seal,
    Rotation,
    Engine,
    AlreadyOpen,
    NotOpen,
    Lock,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Configuration { .. } => ErrorKind::Configuration,
            StoreError::Integrity { .. } => ErrorKind::Integrity,
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::Seal { .. } => ErrorKind::Seal,
            StoreError::Rotation { .. } => ErrorKind::Rotation,
            StoreError::Engine { .. } => ErrorKind::Engine,
            StoreError::AlreadyOpen { .. } => ErrorKind::AlreadyOpen,
            StoreError::NotOpen { .. } => ErrorKind::NotOpen,
            StoreError::Lock { .. } => ErrorKind::Lock,
        }
    }

    /// Whether repeating the same call can succeed without operator action.
    /// Integrity and configuration failures never recover by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Seal { .. } | StoreError::Rotation { .. } => true,
            StoreError::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        StoreError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Io => "io",
            ErrorKind::Seal => "seal",
            ErrorKind::Rotation => "rotation",
            ErrorKind::Engine => "engine",
            ErrorKind::AlreadyOpen => "already_open",
            ErrorKind::NotOpen => "not_open",
            ErrorKind::Lock => "lock",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
