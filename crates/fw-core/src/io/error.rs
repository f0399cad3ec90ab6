//! Error types for the storage core

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations
///
/// Every variant is distinguishable through [`StorageError::kind`] so callers
/// can map failures to exit codes without string matching.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Lock not acquired before the deadline. The caller holds nothing.
    #[error(
        "Failed to acquire lock on {resource} after {retries} retries ({waited:?}); no lock is held by the caller"
    )]
    LockTimeout {
        resource: String,
        waited: Duration,
        retries: u32,
    },

    /// Synchronous entry point used from inside a running async runtime
    #[error("Blocking lock entry called from inside a running async runtime; use the async entry point instead")]
    WrongContext,

    /// An I/O operation exceeded its deadline
    #[error("I/O operation '{op}' on {path} exceeded its deadline of {timeout:?}")]
    IoTimeout {
        op: String,
        path: PathBuf,
        timeout: Duration,
    },

    /// File I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed on-disk payload
    #[error("Invalid storage payload in {path}: {message}")]
    Schema { path: PathBuf, message: String },

    /// Required OS locking capability is unavailable
    #[error("File locking unavailable on this platform: {message}")]
    PlatformUnsupported { message: String },

    /// Path cannot be used as a storage location
    #[error("Invalid storage path {path}: {message}")]
    InvalidPath { path: PathBuf, message: String },

    /// Storage file exceeds the configured size limit
    #[error("Storage file {path} is too large ({size} bytes, limit {limit} bytes)")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    /// The storage helper runtime has been shut down
    #[error("Storage has been closed")]
    Closed,
}

/// Discriminant of [`StorageError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    LockTimeout,
    WrongContext,
    IoTimeout,
    Io,
    Schema,
    PlatformUnsupported,
    InvalidPath,
    TooLarge,
    Closed,
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::LockTimeout { .. } => ErrorKind::LockTimeout,
            StorageError::WrongContext => ErrorKind::WrongContext,
            StorageError::IoTimeout { .. } => ErrorKind::IoTimeout,
            StorageError::Io { .. } => ErrorKind::Io,
            StorageError::Schema { .. } => ErrorKind::Schema,
            StorageError::PlatformUnsupported { .. } => ErrorKind::PlatformUnsupported,
            StorageError::InvalidPath { .. } => ErrorKind::InvalidPath,
            StorageError::TooLarge { .. } => ErrorKind::TooLarge,
            StorageError::Closed => ErrorKind::Closed,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io { source, .. } => crate::io::retry::is_transient(source),
            _ => false,
        }
    }

    /// User-facing message that never includes filesystem paths
    pub fn safe_message(&self) -> String {
        match self {
            StorageError::LockTimeout { waited, .. } => format!(
                "timed out after {:.1}s waiting for the todo file lock",
                waited.as_secs_f64()
            ),
            StorageError::WrongContext => {
                "blocking storage call made from async code".to_string()
            }
            StorageError::IoTimeout { op, timeout, .. } => format!(
                "storage {op} did not finish within {:.1}s",
                timeout.as_secs_f64()
            ),
            StorageError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    "permission denied accessing the todo file".to_string()
                }
                std::io::ErrorKind::NotFound => "todo file or directory not found".to_string(),
                _ => "I/O error accessing the todo file".to_string(),
            },
            StorageError::Schema { message, .. } => format!("todo file is invalid: {message}"),
            StorageError::PlatformUnsupported { .. } => {
                "file locking is not supported on this platform".to_string()
            }
            StorageError::InvalidPath { .. } => "invalid todo file location".to_string(),
            StorageError::TooLarge { size, limit, .. } => format!(
                "todo file is too large ({:.1}MB > {:.0}MB limit)",
                *size as f64 / (1024.0 * 1024.0),
                *limit as f64 / (1024.0 * 1024.0)
            ),
            StorageError::Closed => "storage has been closed".to_string(),
        }
    }
}
