//! Cache error type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by cache state handling.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{operation} {}: {source}", path.display())]
    Io {
        source: std::io::Error,
        path: PathBuf,
        operation: &'static str,
    },

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("{} is not a file", .0.display())]
    NotAFile(PathBuf),

    #[error("encoding state error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>, operation: &'static str) -> Self {
        Error::Io {
            source,
            path: path.into(),
            operation,
        }
    }

    /// True when the underlying cause is a missing file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
