//! Metadata file schemas.
//!
//! Two YAML files drive the repository: `REPOS.yaml` at the root and
//! `project.yaml` inside each project's meta folder. Unknown fields are
//! ignored so metadata can evolve without breaking older binaries.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Root metadata file name.
pub const ROOT_FILE: &str = "REPOS.yaml";
/// Project metadata file name under the meta folder.
pub const PROJECT_FILE: &str = "project.yaml";
/// Default directory for outputs, logs and cached state.
pub const DEFAULT_DATA_DIR: &str = ".repos_data";
/// Default meta folder name.
pub const DEFAULT_META_FOLDER: &str = ".repos";

/// Schema of `REPOS.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RootManifest {
    /// Relative path for outputs, cached data and internal state.
    pub data_dir: Option<String>,
    /// Folder name containing metadata of a project.
    pub meta_folder: Option<String>,
    /// Gitignore-style patterns to skip when scanning for projects.
    pub project_path_exclude: Vec<String>,
    /// Marks this file as the absolute root: the upward search stops here.
    pub absolute_root: bool,
}

/// Schema of `project.yaml` and its include files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProjectManifest {
    /// Name of the project. Required in the main file, ignored in includes.
    pub name: String,
    pub description: String,
    /// Additional metadata files to merge, relative to the meta folder.
    pub includes: Vec<String>,
    pub targets: BTreeMap<String, TargetManifest>,
}

/// Schema of a single target.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TargetManifest {
    pub description: String,
    /// Dependencies, as local (`name`) or global (`project:name`) targets.
    pub deps: Vec<String>,
    /// The target produces a runnable binary.
    pub launch: bool,
    /// The target can never be skipped.
    pub always: bool,
    /// Source sub-directory relative to the project directory.
    #[serde(rename = "subdir")]
    pub sub_dir: Option<String>,
    /// Register an external tool from the output of this target.
    pub register_tool: Option<ToolRegistration>,
    /// At most one entry: tool name to tool parameters.
    pub rule: BTreeMap<String, serde_json::Value>,
}

/// Schema for registering an external tool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ToolRegistration {
    /// Tool name.
    pub name: String,
    /// Executable relative to the source directory. Mutually exclusive
    /// with `out`; when both are empty the primary output is used.
    pub src: String,
    /// Key of the executable in the extra outputs.
    pub out: String,
    /// Launch the executable through the shell.
    pub shell_script: bool,
    /// Additional environment variable templates (`NAME=value`).
    pub env: Vec<String>,
    /// Command line argument templates.
    pub args: Vec<String>,
}

/// Load `REPOS.yaml` from a directory. `Ok(None)` if the file is absent.
pub fn load_root_from_dir(dir: &Path) -> Result<Option<RootManifest>> {
    load_optional(&dir.join(ROOT_FILE))
}

/// Load a project metadata file. `Ok(None)` if the file is absent.
pub fn load_project_file(path: &Path) -> Result<Option<ProjectManifest>> {
    load_optional(path)
}

fn load_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(e, path, "read")),
    };
    let value = serde_yaml::from_str(&data).map_err(|source| Error::Metadata {
        source,
        path: path.to_path_buf(),
    })?;
    Ok(Some(value))
}
