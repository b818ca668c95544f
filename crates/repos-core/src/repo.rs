//! Repository discovery and project loading.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;
use walkdir::WalkDir;

use crate::meta::{self, ProjectManifest, RootManifest};
use crate::project::{Project, Target, TargetName};
use crate::{Error, Result};

const OUT_FOLDER: &str = "out";
const LOG_FOLDER: &str = "log";
const CACHE_FOLDER: &str = "cache";

/// The monolithic repository.
#[derive(Debug)]
pub struct Repo {
    /// Absolute path of the repository root.
    pub root_dir: PathBuf,
    /// Absolute path of the working directory (may differ from PWD).
    pub work_dir: PathBuf,

    data_dir: PathBuf,
    meta_folder: String,
    exclude: Vec<String>,
    projects: BTreeMap<String, Arc<Project>>,
    current_project: Option<String>,
}

impl Repo {
    /// Locate the repository root from `work_dir` (current directory when
    /// `None`) by walking parent directories. The search stops at a root
    /// file marked `absolute-root`; otherwise the topmost root file wins.
    pub fn discover(work_dir: Option<&Path>) -> Result<Self> {
        let work_dir = match work_dir {
            Some(dir) => std::path::absolute(dir)
                .map_err(|e| Error::io(e, dir, "resolve"))?,
            None => std::env::current_dir()
                .map_err(|e| Error::io(e, ".", "resolve"))?,
        };

        let mut dir = work_dir.clone();
        let mut found: Option<(RootManifest, PathBuf)> = None;
        loop {
            if let Some(manifest) = meta::load_root_from_dir(&dir)? {
                let is_absolute_root = manifest.absolute_root;
                found = Some((manifest, dir.clone()));
                if is_absolute_root {
                    break;
                }
            }
            if !dir.pop() {
                break;
            }
        }
        let (manifest, root_dir) = found.ok_or(Error::RootNotFound {
            work_dir: work_dir.clone(),
        })?;

        let data_dir = root_dir.join(
            manifest
                .data_dir
                .as_deref()
                .unwrap_or(meta::DEFAULT_DATA_DIR),
        );
        let meta_folder = manifest
            .meta_folder
            .as_deref()
            .unwrap_or(meta::DEFAULT_META_FOLDER)
            .to_string();
        debug!(root = %root_dir.display(), meta_folder, "located repository root");

        Ok(Self {
            root_dir,
            work_dir,
            data_dir,
            meta_folder,
            exclude: manifest.project_path_exclude,
            projects: BTreeMap::new(),
            current_project: None,
        })
    }

    /// Scan the repository and populate all projects.
    ///
    /// Fails when two projects share a name. Also identifies the current
    /// project: the loaded project whose directory is the longest prefix of
    /// the working directory.
    pub fn load_projects(&mut self) -> Result<()> {
        let exclude = self.build_exclude_matcher()?;
        let work_rel = self
            .work_dir
            .strip_prefix(&self.root_dir)
            .unwrap_or_else(|_| Path::new(""))
            .to_path_buf();

        let mut projects: BTreeMap<String, Arc<Project>> = BTreeMap::new();
        let mut current: Option<String> = None;

        let mut walker = WalkDir::new(&self.root_dir).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| {
                Error::configuration(format!("scan repository error: {e}"))
            })?;
            if !entry.file_type().is_dir() || entry.depth() == 0 {
                continue;
            }
            if entry.file_name().to_str() != Some(self.meta_folder.as_str()) {
                continue;
            }
            // A meta folder never nests projects; stop descending either way.
            walker.skip_current_dir();

            let meta_rel = entry
                .path()
                .strip_prefix(&self.root_dir)
                .expect("walk stays under root")
                .to_path_buf();
            let project_rel = meta_rel
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .to_path_buf();
            if let Some(matcher) = &exclude {
                if matcher.matched_path_or_any_parents(&meta_rel, true).is_ignore()
                    || matcher
                        .matched_path_or_any_parents(&project_rel, true)
                        .is_ignore()
                {
                    debug!(dir = %project_rel.display(), "project path excluded");
                    continue;
                }
            }

            let Some(project) = self.load_project(&project_rel)? else {
                continue;
            };
            if let Some(existing) = projects.get(&project.name) {
                return Err(Error::ProjectNameConflict {
                    name: project.name.clone(),
                    dir: project.dir.clone(),
                    other_dir: existing.dir.clone(),
                });
            }
            let is_closer = work_rel.starts_with(&project.dir)
                && current
                    .as_ref()
                    .and_then(|name| projects.get(name))
                    .map_or(true, |c| {
                        project.dir.as_os_str().len() > c.dir.as_os_str().len()
                    });
            let name = project.name.clone();
            projects.insert(name.clone(), Arc::new(project));
            if is_closer {
                current = Some(name);
            }
        }

        self.projects = projects;
        self.current_project = current;
        Ok(())
    }

    fn build_exclude_matcher(&self) -> Result<Option<Gitignore>> {
        if self.exclude.is_empty() {
            return Ok(None);
        }
        let mut builder = GitignoreBuilder::new(&self.root_dir);
        for pattern in &self.exclude {
            builder.add_line(None, pattern).map_err(|e| {
                Error::configuration(format!(
                    "invalid project-path-exclude pattern {pattern:?}: {e}"
                ))
            })?;
        }
        let matcher = builder.build().map_err(|e| {
            Error::configuration(format!("build project-path-exclude matcher: {e}"))
        })?;
        Ok(Some(matcher))
    }

    /// Load one project from its directory (relative to root), merging the
    /// include files breadth-first; each include is loaded at most once.
    fn load_project(&self, project_rel: &Path) -> Result<Option<Project>> {
        let meta_dir = self.root_dir.join(project_rel).join(&self.meta_folder);
        let main_path = meta_dir.join(meta::PROJECT_FILE);
        let Some(main) = meta::load_project_file(&main_path)? else {
            return Ok(None);
        };
        if main.name.is_empty() {
            return Err(Error::configuration(format!(
                "missing project name: {:?}",
                main_path.display()
            )));
        }

        let mut queue: VecDeque<String> = main.includes.iter().cloned().collect();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(meta::PROJECT_FILE.to_string());
        let mut manifests: Vec<ProjectManifest> = vec![main];
        while let Some(file) = queue.pop_front() {
            if !seen.insert(file.clone()) {
                continue;
            }
            let path = meta_dir.join(&file);
            let manifest = meta::load_project_file(&path)?.ok_or_else(|| {
                Error::configuration(format!(
                    "include file not found: {:?}",
                    path.display()
                ))
            })?;
            queue.extend(manifest.includes.iter().cloned());
            manifests.push(manifest);
        }

        let project = Project::from_manifests(project_rel, &manifests)
            .map_err(|e| match e {
                Error::Configuration(msg) => Error::configuration(format!(
                    "load project from {:?} error: {msg}",
                    project_rel.display()
                )),
                other => other,
            })?;
        debug!(project = %project.name, dir = %project.dir.display(), "loaded project");
        Ok(Some(project))
    }

    /// Find a project by name.
    #[must_use]
    pub fn find_project(&self, name: &str) -> Option<&Arc<Project>> {
        self.projects.get(name)
    }

    /// Find a target by global name.
    #[must_use]
    pub fn find_target(&self, name: &TargetName) -> Option<&Arc<Target>> {
        self.find_project(&name.project)
            .and_then(|p| p.find_target(&name.local))
    }

    /// Loaded projects in name order.
    pub fn projects(&self) -> impl Iterator<Item = &Arc<Project>> {
        self.projects.values()
    }

    /// The project whose folder is the closest ancestor of the working
    /// directory, when one exists.
    #[must_use]
    pub fn current_project(&self) -> Option<&Arc<Project>> {
        self.current_project
            .as_deref()
            .and_then(|name| self.projects.get(name))
    }

    /// Name of the project meta folder.
    #[must_use]
    pub fn meta_folder(&self) -> &str {
        &self.meta_folder
    }

    /// Absolute data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Base output directory.
    #[must_use]
    pub fn out_dir(&self) -> PathBuf {
        self.data_dir.join(OUT_FOLDER)
    }

    /// Directory for log files.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(LOG_FOLDER)
    }

    /// Directory for cached task state and results.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join(CACHE_FOLDER)
    }
}
