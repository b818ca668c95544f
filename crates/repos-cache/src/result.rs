//! Persisted per-task results.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Convert a timestamp to Unix nanoseconds.
#[must_use]
pub fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

/// Persistable result of one task, one file per task.
///
/// The last successful start/end survive later failed or skipped runs;
/// the skip gate compares them against dependency results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskResult {
    /// Start of the last successful build, Unix nanoseconds.
    pub success_build_start_time: i64,
    /// End of the last successful build, Unix nanoseconds.
    pub success_build_end_time: i64,
    /// Start of the last run.
    pub start_time: i64,
    /// End of the last run.
    pub end_time: i64,
    /// The last run skipped execution.
    pub skipped: bool,
    /// Error message of the last run, when it failed.
    pub error: Option<String>,
}

impl TaskResult {
    /// Load a result file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| Error::io(e, path, "load result"))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load a result file, falling back to the default on any error.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Write the result file.
    pub fn store(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        std::fs::write(path, data).map_err(|e| Error::io(e, path, "write result"))
    }

    /// A successful build has been recorded at some point.
    #[must_use]
    pub fn has_success(&self) -> bool {
        self.success_build_start_time != 0 && self.success_build_end_time != 0
    }
}

/// Path of the result file for a global task name.
#[must_use]
pub fn result_file(cache_dir: &Path, task_name: &str) -> PathBuf {
    cache_dir.join(format!("{task_name}.result"))
}

/// Path of the cache state file for a global task name.
#[must_use]
pub fn state_file(cache_dir: &Path, task_name: &str) -> PathBuf {
    cache_dir.join(format!("{task_name}.state"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_tracks_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = result_file(dir.path(), "proj:build");

        let mut result = TaskResult::load_or_default(&path);
        assert!(!result.has_success());

        result.start_time = 10;
        result.end_time = 20;
        result.success_build_start_time = 10;
        result.success_build_end_time = 20;
        result.store(&path).unwrap();

        let loaded = TaskResult::load(&path).unwrap();
        assert!(loaded.has_success());
        assert!(!loaded.skipped);
        assert!(loaded.error.is_none());
    }

    #[test]
    fn file_names_use_global_task_name() {
        let dir = Path::new("/data/cache");
        assert_eq!(
            result_file(dir, "p:t"),
            PathBuf::from("/data/cache/p:t.result")
        );
        assert_eq!(
            state_file(dir, "p:t"),
            PathBuf::from("/data/cache/p:t.state")
        );
    }
}
