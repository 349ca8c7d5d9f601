use std::io;
use thiserror::Error;

/// Errors surfaced by the filesystem layer.
///
/// Absence is usually reported as a value (`Option::None`, `false`) by the
/// adapter and metadata layers; `NotFound` only appears when an operation
/// requires the object to exist (read-open, unlink, rmdir).
#[derive(Error, Debug)]
pub enum FsError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("path is longer than {limit} characters: {path}")]
    PathTooLong { path: String, limit: usize },

    #[error("operation is not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("rename of {from} stopped after {moved} of {total} objects: {source}")]
    RenameIncomplete {
        from: String,
        moved: usize,
        total: usize,
        #[source]
        source: Box<FsError>,
    },

    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Unknown(String),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
