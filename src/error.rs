//! Daemon-wide error taxonomy (`SPEC_FULL.md` §10 / spec.md §7).
//!
//! Every error a component can raise is classified into one of the seven
//! kinds below. The classification, not the message text, drives recovery:
//! `FileStateManager` matches on `ErrorKind` to decide `skipped` vs `failed`
//! vs `corrupted`; the WebSocket layer matches on it to pick an error code.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Resource,
    Corruption,
    Transient,
    FatalWorker,
    Protocol,
    Internal,
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("path does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("folder overlaps an existing entry: {0}")]
    OverlappingFolder(PathBuf),

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("file too large ({size} bytes, cap {cap} bytes): {path}")]
    FileTooLarge { path: PathBuf, size: u64, cap: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("file missing: {0}")]
    FileMissing(PathBuf),

    #[error("file rejected as corrupted: {0}")]
    Corrupted(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("embedding worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("model load timed out after {0:?}")]
    ModelLoadTimeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Validation(_)
            | DaemonError::NotADirectory(_)
            | DaemonError::OverlappingFolder(_)
            | DaemonError::UnsupportedModel(_)
            | DaemonError::PathNotFound(_) => ErrorKind::Validation,
            DaemonError::FileTooLarge { .. }
            | DaemonError::PermissionDenied(_)
            | DaemonError::FileMissing(_) => ErrorKind::Resource,
            DaemonError::Corrupted(_) => ErrorKind::Corruption,
            DaemonError::Transient(_) => ErrorKind::Transient,
            DaemonError::WorkerCrashed(_) | DaemonError::ModelLoadTimeout(_) => {
                ErrorKind::FatalWorker
            }
            DaemonError::Protocol(_) => ErrorKind::Protocol,
            DaemonError::Io(_) | DaemonError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the File State Manager should mark the file `corrupted`
    /// (absorbing) rather than `failed` (retryable) for this error.
    pub fn is_corrupting(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corruption)
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;
