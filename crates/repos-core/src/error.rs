//! Error type shared across repository loading and name resolution.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading a repository or resolving names.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{operation} {}: {source}", path.display())]
    Io {
        source: std::io::Error,
        path: PathBuf,
        operation: &'static str,
    },

    #[error("parse {}: {source}", path.display())]
    Metadata {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[error("root file not found from {}", work_dir.display())]
    RootNotFound { work_dir: PathBuf },

    #[error("conflict project name {name:?} in {dir:?} and {other_dir:?}")]
    ProjectNameConflict {
        name: String,
        dir: PathBuf,
        other_dir: PathBuf,
    },

    #[error("bad pattern {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("ambiguous match: use \"*:{pattern}\" for matching multiple targets")]
    AmbiguousMatch {
        pattern: String,
        /// Global names of every matched target, for user inspection.
        matches: Vec<String>,
    },

    #[error("no current project, please start from inside (or a subdirectory of) a project folder")]
    NoCurrentProject,

    #[error("unknown target {0:?}")]
    UnknownTarget(String),

    #[error("only one tool can be specified in rule of target {0:?}")]
    TooManyTools(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn io(source: std::io::Error, path: impl Into<PathBuf>, operation: &'static str) -> Self {
        Error::Io {
            source,
            path: path.into(),
            operation,
        }
    }
}
