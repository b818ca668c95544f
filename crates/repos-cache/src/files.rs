//! The per-task files cache: declaration, verification and persistence.

use std::path::{Path, PathBuf};

use repos_core::LogFile;

use crate::state::{load_state, FileCacheState, FileEntry, OutputFiles};
use crate::{Error, Result};

/// Directories a cache instance operates on. All absolute.
#[derive(Debug, Clone)]
pub struct CachePaths {
    /// The task's state file (`<cache-dir>/<project>:<local>.state`).
    pub state_file: PathBuf,
    /// The owning project directory; inputs are relative to this.
    pub project_dir: PathBuf,
    /// The effective source directory; sources and generates are relative
    /// to this.
    pub source_dir: PathBuf,
    /// The project output directory; outputs are relative to this.
    pub out_dir: PathBuf,
}

/// Tracks the files a task reads and writes to decide whether it can be
/// skipped on the next run.
pub struct FilesCache {
    paths: CachePaths,
    log: Option<LogFile>,
    current: FileCacheState,
    saved: Option<FileCacheState>,
}

impl FilesCache {
    #[must_use]
    pub fn new(paths: CachePaths, log: Option<LogFile>) -> Self {
        Self {
            paths,
            log,
            current: FileCacheState::default(),
            saved: None,
        }
    }

    fn diag(&self, msg: impl AsRef<str>) {
        if let Some(log) = &self.log {
            log.line(msg.as_ref());
        }
        tracing::debug!("{}", msg.as_ref());
    }

    /// Add an input path relative to the project directory. With
    /// `recursive`, the subtree is walked and every entry recorded.
    pub fn add_input(&mut self, rel: &str, recursive: bool) -> Result<()> {
        let base = self.paths.project_dir.join(rel);
        self.add_path(&base, recursive)
    }

    /// Add an input path relative to the effective source directory.
    pub fn add_source(&mut self, rel: &str, recursive: bool) -> Result<()> {
        let base = self.paths.source_dir.join(rel);
        self.add_path(&base, recursive)
    }

    fn add_path(&mut self, path: &Path, recursive: bool) -> Result<()> {
        if recursive {
            for entry in walkdir::WalkDir::new(path) {
                let entry = entry.map_err(|e| {
                    let io = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk error"));
                    Error::io(io, path, "walk input")
                })?;
                let meta = entry
                    .metadata()
                    .map_err(|e| {
                        let io = e
                            .into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("walk error"));
                        Error::io(io, entry.path(), "stat input")
                    })?;
                self.record_input(entry.path().to_path_buf(), FileEntry::from_metadata(&meta));
            }
            return Ok(());
        }
        let meta = std::fs::metadata(path).map_err(|e| Error::io(e, path, "stat input"))?;
        self.record_input(path.to_path_buf(), FileEntry::from_metadata(&meta));
        Ok(())
    }

    fn record_input(&mut self, path: PathBuf, entry: FileEntry) {
        let display = path
            .strip_prefix(&self.paths.project_dir)
            .unwrap_or(&path)
            .display()
            .to_string();
        self.diag(format!("Input {display:?} {entry}"));
        self.current.inputs.insert(path, entry);
    }

    /// Add an output path relative to the project output directory. A
    /// trailing `/` marks a directory. An empty key marks the primary
    /// output. Modification times are captured at persist time.
    pub fn add_output(&mut self, key: &str, rel: &str) {
        let dir = rel.ends_with('/');
        let clean = rel.trim_end_matches('/');
        let path = self.paths.out_dir.join(clean);
        self.current.outputs.insert(path, FileEntry { dir, mtime: 0 });
        if key.is_empty() {
            self.diag(format!("Output PRIMARY {rel:?}"));
            self.current.task_outputs.primary = rel.to_string();
        } else {
            self.diag(format!("Output [{key}] {rel:?}"));
            self.current
                .task_outputs
                .extra
                .insert(key.to_string(), rel.to_string());
        }
    }

    /// Add a file or directory (trailing `/`) generated into the source
    /// tree, relative to the source directory.
    pub fn add_generated(&mut self, rel: &str) {
        let dir = rel.ends_with('/');
        let clean = rel.trim_end_matches('/');
        let path = self.paths.source_dir.join(clean);
        self.current
            .generates
            .insert(path, FileEntry { dir, mtime: 0 });
        self.current
            .task_outputs
            .generated_files
            .push(rel.to_string());
        self.diag(format!("Generate {rel:?}"));
    }

    /// Append opaque strings in insertion order.
    pub fn add_opaque<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            let value = value.into();
            self.diag(format!("Opaque {value}"));
            self.current.opaque.push(value);
        }
    }

    /// Load the previously saved state.
    pub fn load(&mut self) -> Result<()> {
        self.saved = Some(load_state(&self.paths.state_file)?);
        Ok(())
    }

    /// Compare the current declaration against the saved state and the
    /// filesystem. Every mismatch is logged with the discrepancy.
    pub fn verify(&mut self) -> bool {
        if self.saved.is_none() {
            if let Err(e) = self.load() {
                self.diag(format!("Cache {e}"));
                return false;
            }
        }
        let saved = self.saved.as_ref().expect("saved state just loaded");

        if !compare_keys(&saved.outputs, &self.current.outputs, "outputs", &self.log)
            || !compare_keys(
                &saved.generates,
                &self.current.generates,
                "generates",
                &self.log,
            )
            || !compare_entries(&saved.inputs, &self.current.inputs, "inputs", &self.log)
        {
            return false;
        }

        if saved.task_outputs.primary != self.current.task_outputs.primary {
            self.diag(format!(
                "Cache primary output {:?} vs {:?}",
                saved.task_outputs.primary, self.current.task_outputs.primary
            ));
        }
        if saved.task_outputs.extra.len() != self.current.task_outputs.extra.len() {
            self.diag(format!(
                "Cache extra outputs length {} vs {}",
                saved.task_outputs.extra.len(),
                self.current.task_outputs.extra.len()
            ));
            return false;
        }
        for key in saved.task_outputs.extra.keys() {
            if !self.current.task_outputs.extra.contains_key(key) {
                self.diag(format!("Cache extra outputs[{key:?}] not found"));
                return false;
            }
        }

        if saved.opaque.len() != self.current.opaque.len() {
            self.diag("Cache opaque size differs");
            return false;
        }
        for (n, (old, new)) in saved
            .opaque
            .iter()
            .zip(self.current.opaque.iter())
            .enumerate()
        {
            if old != new {
                self.diag(format!("Cache opaque[{n}] {new:?} vs {old:?} (saved)"));
                return false;
            }
        }

        let saved = self.saved.as_ref().expect("saved state present");
        if let Err(msg) = check_up_to_date(&self.current.outputs, &saved.outputs) {
            self.diag(format!("Cache output: {msg}"));
            return false;
        }
        if let Err(msg) = check_up_to_date(&self.current.generates, &saved.generates) {
            self.diag(format!("Cache generate: {msg}"));
            return false;
        }
        true
    }

    /// Stat every declared output and generate, then write the whole state
    /// atomically (temp file plus rename).
    pub fn persist(&mut self) -> Result<()> {
        refresh_entries(&mut self.current.outputs)?;
        refresh_entries(&mut self.current.generates)?;
        let data = serde_json::to_vec(&self.current)?;
        let tmp = self.paths.state_file.with_extension("state.tmp");
        std::fs::write(&tmp, &data).map_err(|e| Error::io(e, &tmp, "write state"))?;
        std::fs::rename(&tmp, &self.paths.state_file)
            .map_err(|e| Error::io(e, &self.paths.state_file, "rename state"))?;
        Ok(())
    }

    /// Delete the saved state file. Missing state is not an error.
    pub fn clear_saved(&self) -> Result<()> {
        match std::fs::remove_file(&self.paths.state_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &self.paths.state_file, "remove state")),
        }
    }

    /// Output files of the current declaration.
    #[must_use]
    pub fn task_outputs(&self) -> &OutputFiles {
        &self.current.task_outputs
    }

    /// Output files recorded in the saved state, when loaded.
    #[must_use]
    pub fn saved_task_outputs(&self) -> Option<&OutputFiles> {
        self.saved.as_ref().map(|s| &s.task_outputs)
    }
}

fn compare_keys(
    saved: &std::collections::BTreeMap<PathBuf, FileEntry>,
    current: &std::collections::BTreeMap<PathBuf, FileEntry>,
    title: &str,
    log: &Option<LogFile>,
) -> bool {
    let diag = |msg: String| {
        if let Some(log) = log {
            log.line(&msg);
        }
        tracing::debug!("{msg}");
    };
    if saved.len() != current.len() {
        diag(format!(
            "Cache {title} length {} vs {}",
            saved.len(),
            current.len()
        ));
        return false;
    }
    for path in saved.keys() {
        if !current.contains_key(path) {
            diag(format!("Cache {title}[{:?}] not found", path.display()));
            return false;
        }
    }
    true
}

fn compare_entries(
    saved: &std::collections::BTreeMap<PathBuf, FileEntry>,
    current: &std::collections::BTreeMap<PathBuf, FileEntry>,
    title: &str,
    log: &Option<LogFile>,
) -> bool {
    let diag = |msg: String| {
        if let Some(log) = log {
            log.line(&msg);
        }
        tracing::debug!("{msg}");
    };
    if saved.len() != current.len() {
        diag(format!(
            "Cache {title} length {} vs {}",
            saved.len(),
            current.len()
        ));
        return false;
    }
    for (path, old) in saved {
        let Some(new) = current.get(path) else {
            diag(format!("Cache {title}[{:?}] not found", path.display()));
            return false;
        };
        if old.dir != new.dir {
            diag(format!(
                "Cache {title}[{:?}] IsDir {} vs {}",
                path.display(),
                old.dir,
                new.dir
            ));
            return false;
        }
        if old.mtime != new.mtime {
            diag(format!(
                "Cache {title}[{:?}] mtime {} vs {}",
                path.display(),
                old.mtime,
                new.mtime
            ));
            return false;
        }
    }
    true
}

/// Every declared path must still exist with the saved kind and mtime.
fn check_up_to_date(
    current: &std::collections::BTreeMap<PathBuf, FileEntry>,
    saved: &std::collections::BTreeMap<PathBuf, FileEntry>,
) -> std::result::Result<(), String> {
    for path in current.keys() {
        let meta = std::fs::metadata(path)
            .map_err(|e| format!("stat {:?} error: {e}", path.display()))?;
        let disk = FileEntry::from_metadata(&meta);
        match saved.get(path) {
            Some(entry) if entry.dir == disk.dir && entry.mtime == disk.mtime => {}
            _ => return Err(format!("out-of-date: {:?}", path.display())),
        }
    }
    Ok(())
}

fn refresh_entries(
    entries: &mut std::collections::BTreeMap<PathBuf, FileEntry>,
) -> Result<()> {
    for (path, entry) in entries.iter_mut() {
        let meta = std::fs::metadata(path).map_err(|e| Error::io(e, path.clone(), "stat"))?;
        if entry.dir != meta.is_dir() {
            if entry.dir {
                return Err(Error::NotADirectory(path.clone()));
            }
            return Err(Error::NotAFile(path.clone()));
        }
        entry.mtime = FileEntry::from_metadata(&meta).mtime;
    }
    Ok(())
}
