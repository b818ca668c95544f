//! Projects and targets as loaded into memory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::meta::{ProjectManifest, TargetManifest, ToolRegistration};
use crate::{Error, Result};

/// A target name split into project and local parts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetName {
    /// Owning project. Empty for a bare local name.
    pub project: String,
    pub local: String,
}

impl TargetName {
    /// Split a `project:local` or bare `local` name.
    #[must_use]
    pub fn split(name: &str) -> Self {
        match name.split_once(':') {
            Some((project, local)) => Self {
                project: project.to_string(),
                local: local.to_string(),
            },
            None => Self {
                project: String::new(),
                local: name.to_string(),
            },
        }
    }

    /// The `project:local` form. Invalid when `project` is empty.
    #[must_use]
    pub fn global(&self) -> String {
        format!("{}:{}", self.project, self.local)
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.local)
    }
}

/// The tool selector of a target: at most one per target.
#[derive(Debug, Clone)]
pub struct Rule {
    pub tool: String,
    pub params: serde_json::Value,
}

impl Rule {
    /// Decode the tool parameters into a typed struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| Error::configuration(format!("decode params error: {e}")))
    }
}

/// A build target inside a project. Immutable after loading.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: TargetName,
    /// Project directory relative to the repository root.
    pub project_dir: PathBuf,
    /// Source sub-directory relative to the project directory.
    pub sub_dir: Option<PathBuf>,
    pub description: String,
    pub deps: Vec<String>,
    /// Never skip this target.
    pub always: bool,
    /// The primary output is a runnable binary.
    pub launch: bool,
    /// `None` makes this a dummy target aggregating its dependencies.
    pub rule: Option<Rule>,
    pub register_tool: Option<ToolRegistration>,
}

impl Target {
    fn from_manifest(
        project_name: &str,
        project_dir: &Path,
        local: &str,
        manifest: &TargetManifest,
    ) -> Result<Arc<Self>> {
        let name = TargetName {
            project: project_name.to_string(),
            local: local.to_string(),
        };
        if manifest.rule.len() > 1 {
            return Err(Error::TooManyTools(name.global()));
        }
        let rule = manifest.rule.iter().next().map(|(tool, params)| Rule {
            tool: tool.clone(),
            params: params.clone(),
        });
        if let Some(reg) = &manifest.register_tool {
            if reg.name.is_empty() {
                return Err(Error::configuration(format!(
                    "target {:?}: register-tool.name is empty",
                    name.global()
                )));
            }
            if !reg.out.is_empty() && !reg.src.is_empty() {
                return Err(Error::configuration(format!(
                    "target {:?}: out and src can't be used at same time in register-tool",
                    name.global()
                )));
            }
        }
        Ok(Arc::new(Self {
            name,
            project_dir: project_dir.to_path_buf(),
            sub_dir: manifest.sub_dir.as_ref().map(PathBuf::from),
            description: manifest.description.clone(),
            deps: manifest.deps.clone(),
            always: manifest.always,
            launch: manifest.launch,
            rule,
            register_tool: manifest.register_tool.clone(),
        }))
    }

    /// Global `project:local` name.
    #[must_use]
    pub fn global_name(&self) -> String {
        self.name.global()
    }

    /// Absolute project directory.
    #[must_use]
    pub fn project_dir_abs(&self, root: &Path) -> PathBuf {
        root.join(&self.project_dir)
    }

    /// Absolute source directory (project dir plus optional sub-dir).
    #[must_use]
    pub fn source_dir(&self, root: &Path) -> PathBuf {
        match &self.sub_dir {
            Some(sub) => self.project_dir_abs(root).join(sub),
            None => self.project_dir_abs(root),
        }
    }

    /// A dummy target aggregates dependencies without performing work.
    #[must_use]
    pub fn is_dummy(&self) -> bool {
        self.rule.is_none()
    }
}

/// A loaded project. Immutable after loading.
#[derive(Debug)]
pub struct Project {
    pub name: String,
    /// Directory relative to the repository root.
    pub dir: PathBuf,
    pub description: String,
    targets: BTreeMap<String, Arc<Target>>,
}

impl Project {
    /// Build a project from its merged manifest set.
    ///
    /// `manifests` must hold the main `project.yaml` first, followed by the
    /// include files in breadth-first order; later files override earlier
    /// entries per target name.
    pub(crate) fn from_manifests(
        dir: &Path,
        manifests: &[ProjectManifest],
    ) -> Result<Self> {
        let main = &manifests[0];
        let mut merged: BTreeMap<String, TargetManifest> = BTreeMap::new();
        for manifest in manifests {
            for (name, target) in &manifest.targets {
                merged.insert(name.clone(), target.clone());
            }
        }

        let mut targets = BTreeMap::new();
        for (local, manifest) in &merged {
            let target = Target::from_manifest(&main.name, dir, local, manifest)?;
            targets.insert(local.clone(), target);
        }
        Ok(Self {
            name: main.name.clone(),
            dir: dir.to_path_buf(),
            description: main.description.clone(),
            targets,
        })
    }

    /// Find a target by local name.
    #[must_use]
    pub fn find_target(&self, local: &str) -> Option<&Arc<Target>> {
        self.targets.get(local)
    }

    /// Iterate targets in local-name order.
    pub fn targets(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.values()
    }

    /// Output directory of this project under the repository output base.
    #[must_use]
    pub fn out_dir(&self, out_base: &Path) -> PathBuf {
        out_base.join(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_target_names() {
        let n = TargetName::split("proj:tgt");
        assert_eq!(n.project, "proj");
        assert_eq!(n.local, "tgt");
        assert_eq!(n.global(), "proj:tgt");

        let bare = TargetName::split("tgt");
        assert!(bare.project.is_empty());
        assert_eq!(bare.local, "tgt");

        // Only the first colon splits.
        let odd = TargetName::split("a:b:c");
        assert_eq!(odd.project, "a");
        assert_eq!(odd.local, "b:c");
    }

    #[test]
    fn rejects_multiple_rule_entries() {
        let mut manifest = TargetManifest::default();
        manifest
            .rule
            .insert("exec".into(), serde_json::Value::Null);
        manifest
            .rule
            .insert("files".into(), serde_json::Value::Null);
        let err = Target::from_manifest("p", Path::new("p"), "t", &manifest).unwrap_err();
        assert!(matches!(err, Error::TooManyTools(name) if name == "p:t"));
    }

    #[test]
    fn include_targets_override_main() {
        let mut main = ProjectManifest::default();
        main.name = "app".into();
        let mut t = TargetManifest::default();
        t.description = "from main".into();
        main.targets.insert("build".into(), t);

        let mut inc = ProjectManifest::default();
        let mut t2 = TargetManifest::default();
        t2.description = "from include".into();
        inc.targets.insert("build".into(), t2);

        let project = Project::from_manifests(Path::new("app"), &[main, inc]).unwrap();
        assert_eq!(
            project.find_target("build").unwrap().description,
            "from include"
        );
    }

    #[test]
    fn source_dir_honours_sub_dir() {
        let mut manifest = TargetManifest::default();
        manifest.sub_dir = Some("src".into());
        let target =
            Target::from_manifest("p", Path::new("lib/p"), "build", &manifest).unwrap();
        assert_eq!(
            target.source_dir(Path::new("/repo")),
            PathBuf::from("/repo/lib/p/src")
        );
        assert!(target.is_dummy());
    }
}
