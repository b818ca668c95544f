//! Engine error type.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while planning or executing a task graph.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] repos_core::Error),

    #[error(transparent)]
    Cache(#[from] repos_cache::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{operation} {}: {source}", path.display())]
    Io {
        source: std::io::Error,
        path: std::path::PathBuf,
        operation: &'static str,
    },

    #[error("not a global target name: {0:?}")]
    NotGlobalTargetName(String),

    #[error("unknown target {0:?}")]
    UnknownTarget(String),

    #[error("unknown dependency {dep:?} of target {target:?}")]
    UnknownDependency { dep: String, target: String },

    #[error("cyclic dependencies in {}", tasks.join(","))]
    CyclicDependencies { tasks: Vec<String> },

    #[error("unknown tool: {0:?}")]
    UnknownTool(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("command {command:?} failed: {status}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
    },

    #[error("some tasks failed")]
    SomeTasksFailed,

    #[error("incomplete")]
    Incomplete,

    #[error("canceled")]
    Canceled,
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn io(
        source: std::io::Error,
        path: impl Into<std::path::PathBuf>,
        operation: &'static str,
    ) -> Self {
        Error::Io {
            source,
            path: path.into(),
            operation,
        }
    }
}

/// Outcome of a tool executor run: either real work was done or the cache
/// was up-to-date and the task was skipped. Failure travels separately as
/// an [`Error`] so skipping is never conflated with success or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Completed,
    Skipped,
}
