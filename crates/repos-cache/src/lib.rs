//! Incremental build cache for `repos`.
//!
//! Tracks the inputs, outputs, generated files and opaque parameters of a
//! task between runs, keyed on modification time. One state file and one
//! result file per task, both JSON under `<data-dir>/cache`.

mod error;
mod files;
mod result;
mod state;

pub use error::{Error, Result};
pub use files::{CachePaths, FilesCache};
pub use result::{result_file, state_file, unix_nanos, TaskResult};
pub use state::{load_state, FileCacheState, FileEntry, OutputFiles};
