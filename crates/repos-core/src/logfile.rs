//! Plain-file log sink for build artifacts.
//!
//! The dispatcher, the per-task engine logs and the cache diagnostics all
//! write timestamped lines into files under `<data-dir>/log`. These files
//! are part of the build output and survive for post-mortem inspection,
//! which is why they bypass `tracing` entirely.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::{Error, Result};

/// A shareable handle to a timestamped line-oriented log file.
///
/// Write failures are swallowed: losing a log line must never fail a build.
#[derive(Clone)]
pub struct LogFile {
    prefix: String,
    inner: Arc<Mutex<File>>,
}

impl LogFile {
    /// Create (truncate) the log file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::io(e, path, "create"))?;
        Ok(Self {
            prefix: String::new(),
            inner: Arc::new(Mutex::new(file)),
        })
    }

    /// Return a handle writing the same file with `prefix ` before each line.
    #[must_use]
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Append one timestamped line.
    pub fn line(&self, msg: impl AsRef<str>) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.prefix.is_empty() {
            let _ = writeln!(guard, "{stamp} {}", msg.as_ref());
        } else {
            let _ = writeln!(guard, "{stamp} {} {}", self.prefix, msg.as_ref());
        }
        let _ = guard.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_prefix_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.log");
        let log = LogFile::create(&path).unwrap();
        log.line("hello");
        log.with_prefix("tool").line("world");

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().ends_with(" hello"));
        assert!(lines.next().unwrap().ends_with(" tool world"));
    }
}
