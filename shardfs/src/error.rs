use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Message carried by [`StoreError::NotFound`]. Callers matching on the
/// rendered error can rely on it staying fixed.
pub const NOT_FOUND_MESSAGE: &str = "Not found";

/// Message carried by [`StoreError::InvalidPath`].
pub const INVALID_PATH_MESSAGE: &str = "Invalid directory path supplied";

#[derive(Error, Debug)]
pub enum StoreError {
    /// The shard is absent. Only raised by reads (`get`, `peek`, `size`).
    #[error("Not found")]
    NotFound(String), // Contains the key

    /// The storage root exists but is not a directory.
    #[error("Invalid directory path supplied")]
    InvalidPath(PathBuf),

    #[error("Invalid shard key: {0:?}")]
    InvalidKey(String),

    #[error("Unsupported storage backend: {0}")]
    UnsupportedBackend(String),

    /// Any other filesystem failure, returned exactly as the OS reported it.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns the underlying I/O error, if this is one.
    pub fn as_io(&self) -> Option<&io::Error> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}
