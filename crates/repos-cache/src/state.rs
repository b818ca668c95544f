//! Persisted cache state model.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Fingerprint of one tracked path: kind plus modification time.
///
/// Serialized compactly as `"F<nanos>"` for files and `"D<nanos>"` for
/// directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    pub dir: bool,
    /// Modification time in Unix nanoseconds. Zero until stat'ed.
    pub mtime: i64,
}

impl FileEntry {
    #[must_use]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as i64);
        Self {
            dir: meta.is_dir(),
            mtime,
        }
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", if self.dir { 'D' } else { 'F' }, self.mtime)
    }
}

impl Serialize for FileEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FileEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntryVisitor;

        impl Visitor<'_> for EntryVisitor {
            type Value = FileEntry;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string like \"F<nanos>\" or \"D<nanos>\"")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<FileEntry, E> {
                let mut chars = value.chars();
                let dir = match chars.next() {
                    Some('D') => true,
                    Some('F') => false,
                    _ => return Err(E::custom("invalid value")),
                };
                let mtime = chars
                    .as_str()
                    .parse::<i64>()
                    .map_err(|_| E::custom("invalid value"))?;
                Ok(FileEntry { dir, mtime })
            }
        }

        deserializer.deserialize_str(EntryVisitor)
    }
}

/// The output files published by a task.
///
/// All paths are relative to the owning project's output directory, except
/// `generated_files` which are relative to the task's source directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFiles {
    /// The primary output path, empty when the task has none.
    pub primary: String,
    /// Additional outputs indexed by key (`CC_INC_DIR`, `INSTALL_DIR`, ...).
    pub extra: BTreeMap<String, String>,
    /// Files written back into the source tree.
    pub generated_files: Vec<String>,
}

/// The whole persisted fingerprint of one task run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCacheState {
    /// Absolute input path to fingerprint.
    pub inputs: BTreeMap<PathBuf, FileEntry>,
    /// Absolute output path to fingerprint.
    pub outputs: BTreeMap<PathBuf, FileEntry>,
    /// Absolute generated path to fingerprint.
    pub generates: BTreeMap<PathBuf, FileEntry>,
    /// Opaque strings; equality is positional.
    pub opaque: Vec<String>,
    pub task_outputs: OutputFiles,
}

/// Load a persisted state file.
pub fn load_state(path: &Path) -> Result<FileCacheState> {
    let data = std::fs::read(path).map_err(|e| Error::io(e, path, "load state"))?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_entry_round_trips_compact_encoding() {
        let entry = FileEntry {
            dir: false,
            mtime: 1_722_000_000_123_456_789,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, "\"F1722000000123456789\"");
        let back: FileEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);

        let dir_entry: FileEntry = serde_json::from_str("\"D42\"").unwrap();
        assert!(dir_entry.dir);
        assert_eq!(dir_entry.mtime, 42);
    }

    #[test]
    fn file_entry_rejects_garbage() {
        assert!(serde_json::from_str::<FileEntry>("\"\"").is_err());
        assert!(serde_json::from_str::<FileEntry>("\"X12\"").is_err());
        assert!(serde_json::from_str::<FileEntry>("\"Fnope\"").is_err());
    }

    #[test]
    fn state_serializes_deterministically() {
        let mut state = FileCacheState::default();
        state
            .inputs
            .insert(PathBuf::from("/r/b.c"), FileEntry { dir: false, mtime: 2 });
        state
            .inputs
            .insert(PathBuf::from("/r/a.c"), FileEntry { dir: false, mtime: 1 });
        state.opaque.push("-O2".into());
        state.task_outputs.primary = "bin/x".into();

        let json = serde_json::to_string(&state).unwrap();
        // BTreeMap keys come out sorted.
        assert!(json.find("/r/a.c").unwrap() < json.find("/r/b.c").unwrap());

        let back: FileCacheState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.opaque, vec!["-O2"]);
        assert_eq!(back.task_outputs.primary, "bin/x");
    }
}
