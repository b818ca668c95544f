//! Per-task execution context handed to tool executors.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use repos_cache::{state_file, CachePaths, FilesCache, OutputFiles};
use repos_core::{LogFile, Target, TargetName};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::template;
use crate::{Error, Result};

/// Snapshot of one (transitive) dependency taken when the task was
/// dispatched. Dependencies are complete by then, so the snapshot cannot
/// go stale.
#[derive(Debug, Clone)]
pub struct DepHandle {
    pub name: TargetName,
    /// Direct dependency of the current task (templates may only consume
    /// outputs of direct dependencies).
    pub direct: bool,
    /// The dependency was skipped in this run.
    pub skipped: bool,
    pub outputs: Option<OutputFiles>,
    /// Project directory relative to the repository root.
    pub project_dir: PathBuf,
}

impl DepHandle {
    /// The dependency's project output directory.
    #[must_use]
    pub fn out_dir(&self, out_base: &Path) -> PathBuf {
        out_base.join(&self.project_dir)
    }

    /// The dependency's project source directory.
    #[must_use]
    pub fn source_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.project_dir)
    }

    /// Output sub-directories that hold executables: any output under
    /// `bin/`, plus `<INSTALL_DIR>/bin` when an install dir is published.
    #[must_use]
    pub fn bin_dirs(&self, out_base: &Path) -> Vec<PathBuf> {
        let Some(outputs) = &self.outputs else {
            return Vec::new();
        };
        let out_dir = self.out_dir(out_base);
        let mut dirs = Vec::new();
        let mut push_prefixed = |prefix: &str| {
            let matches = |path: &str| {
                path == prefix || path.starts_with(&format!("{prefix}/"))
            };
            if matches(&outputs.primary) || outputs.extra.values().any(|v| matches(v)) {
                let dir = out_dir.join(prefix);
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        };
        push_prefixed("bin");
        if let Some(install) = outputs.extra.get("INSTALL_DIR") {
            let install = install.trim_end_matches('/');
            push_prefixed(&format!("{install}/bin"));
        }
        dirs
    }
}

/// Everything a tool executor needs to run one task.
pub struct ExecContext {
    /// Global task name.
    pub task_name: String,
    pub target: Arc<Target>,
    pub worker: usize,
    pub root_dir: PathBuf,
    pub meta_folder: String,
    /// Base output directory of the repository.
    pub out_base: PathBuf,
    /// Output directory of the owning project.
    pub out_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// The executor may return [`crate::ExecStatus::Skipped`] when its
    /// cache verifies.
    pub skippable: bool,
    /// Engine log of this task, prefixed with the tool name.
    pub log: LogFile,
    /// Per-task environment added to every spawned process.
    pub extra_env: Vec<(String, String)>,

    pub(crate) deps: Arc<Vec<DepHandle>>,
    out_file: std::fs::File,
    cancel: CancellationToken,
    outputs: Option<OutputFiles>,
}

pub(crate) struct ExecContextParams {
    pub task_name: String,
    pub target: Arc<Target>,
    pub worker: usize,
    pub root_dir: PathBuf,
    pub meta_folder: String,
    pub out_base: PathBuf,
    pub cache_dir: PathBuf,
    pub skippable: bool,
    pub log: LogFile,
    pub deps: Arc<Vec<DepHandle>>,
    pub out_file: std::fs::File,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub(crate) fn new(params: ExecContextParams) -> Self {
        let out_dir = params.out_base.join(&params.target.project_dir);
        let mut ctx = Self {
            task_name: params.task_name,
            target: params.target,
            worker: params.worker,
            root_dir: params.root_dir,
            meta_folder: params.meta_folder,
            out_base: params.out_base,
            out_dir,
            cache_dir: params.cache_dir,
            skippable: params.skippable,
            log: params.log,
            extra_env: Vec::new(),
            deps: params.deps,
            out_file: params.out_file,
            cancel: params.cancel,
            outputs: None,
        };
        ctx.extra_env = ctx.build_env();
        ctx
    }

    fn build_env(&self) -> Vec<(String, String)> {
        let display = |p: &Path| p.display().to_string();
        let mut env = vec![
            ("REPOS_PROJECT".into(), self.target.name.project.clone()),
            ("REPOS_TARGET".into(), self.task_name.clone()),
            ("REPOS_TARGET_NAME".into(), self.target.name.local.clone()),
            ("REPOS_ROOT_DIR".into(), display(&self.root_dir)),
            ("REPOS_PROJECT_DIR".into(), display(&self.project_dir())),
            ("REPOS_SOURCE_DIR".into(), display(&self.source_dir())),
            (
                "REPOS_SOURCE_SUBDIR".into(),
                self.target
                    .sub_dir
                    .as_ref()
                    .map(|p| display(p))
                    .unwrap_or_default(),
            ),
            ("REPOS_METAFOLDER".into(), self.meta_folder.clone()),
            ("REPOS_PROJECT_META_DIR".into(), display(&self.meta_dir())),
            ("REPOS_OUTPUT_BASE".into(), display(&self.out_base)),
            ("REPOS_OUTPUT_DIR".into(), display(&self.out_dir)),
        ];
        if self.skippable {
            env.push(("REPOS_TASK_SKIPPABLE".into(), "1".into()));
        }
        env
    }

    /// Absolute project directory.
    #[must_use]
    pub fn project_dir(&self) -> PathBuf {
        self.target.project_dir_abs(&self.root_dir)
    }

    /// Absolute source directory (project dir plus optional sub-dir).
    #[must_use]
    pub fn source_dir(&self) -> PathBuf {
        self.target.source_dir(&self.root_dir)
    }

    /// Absolute project meta directory.
    #[must_use]
    pub fn meta_dir(&self) -> PathBuf {
        self.project_dir().join(&self.meta_folder)
    }

    /// A files cache bound to this task's state file and directories.
    #[must_use]
    pub fn cache(&self) -> FilesCache {
        FilesCache::new(
            CachePaths {
                state_file: state_file(&self.cache_dir, &self.task_name),
                project_dir: self.project_dir(),
                source_dir: self.source_dir(),
                out_dir: self.out_dir.clone(),
            },
            Some(self.log.clone()),
        )
    }

    /// Publish the task's output files.
    pub fn publish_outputs(&mut self, outputs: OutputFiles) {
        self.outputs = Some(outputs);
    }

    #[must_use]
    pub fn outputs(&self) -> Option<&OutputFiles> {
        self.outputs.as_ref()
    }

    pub(crate) fn take_outputs(&mut self) -> Option<OutputFiles> {
        self.outputs.take()
    }

    /// Output files of the previously persisted state, when one exists.
    #[must_use]
    pub fn load_saved_outputs(&self) -> Option<OutputFiles> {
        repos_cache::load_state(&state_file(&self.cache_dir, &self.task_name))
            .ok()
            .map(|state| state.task_outputs)
    }

    /// Persist the cache, logging instead of failing on error.
    pub fn persist_cache_or_log(&self, cache: &mut FilesCache) {
        if let Err(e) = cache.persist() {
            self.log.line(format!("Persist state error: {e}"));
        }
    }

    fn stdio(&self) -> Result<(Stdio, Stdio)> {
        let stdout = self
            .out_file
            .try_clone()
            .map_err(|e| Error::io(e, "task output file", "clone"))?;
        let stderr = self
            .out_file
            .try_clone()
            .map_err(|e| Error::io(e, "task output file", "clone"))?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    /// A command running in the source directory with the per-task
    /// environment, stdout/stderr appended to the task output file.
    pub fn command(&self, program: &str, args: &[String]) -> Result<Command> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(self.source_dir());
        for (key, value) in &self.extra_env {
            cmd.env(key, value);
        }
        let (stdout, stderr) = self.stdio()?;
        cmd.stdout(stdout);
        cmd.stderr(stderr);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    /// A command invoking a shell command line.
    pub fn shell_command(&self, command_line: &str) -> Result<Command> {
        self.command(
            &shell_program(),
            &["-c".to_string(), command_line.to_string()],
        )
    }

    /// A command invoking a shell script with arguments.
    pub fn shell_script(&self, script: &str, args: &[String]) -> Result<Command> {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(script.to_string());
        all.extend(args.iter().cloned());
        self.command(&shell_program(), &all)
    }

    /// Apply `KEY=VALUE` strings to a command's environment. Entries
    /// without `=` name variables that are inherited anyway and are
    /// ignored.
    pub fn extend_env(&self, cmd: &mut Command, envs: &[String]) {
        for env in envs {
            if let Some((key, value)) = env.split_once('=') {
                if !key.is_empty() {
                    cmd.env(key, value);
                }
            }
        }
    }

    /// Prepend the `bin/` output directories of direct and transitive
    /// dependencies to `PATH`.
    pub fn add_bin_paths(&self, cmd: &mut Command) {
        // Dependency snapshots are in post-order; closest deps win.
        let mut dirs: Vec<PathBuf> = Vec::new();
        for dep in self.deps.iter() {
            for dir in dep.bin_dirs(&self.out_base) {
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }
        if dirs.is_empty() {
            return;
        }
        dirs.reverse();
        let mut path = dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        if let Ok(existing) = std::env::var("PATH") {
            if !existing.is_empty() {
                path = format!("{path}:{existing}");
            }
        }
        cmd.env("PATH", path);
    }

    /// Run a command, logging start and completion. Cancellation kills
    /// the child process.
    pub async fn run_and_log(&self, mut cmd: Command) -> Result<()> {
        let display = command_display(&cmd);
        self.log.line(format!("CMD START {display}"));
        let mut child = cmd.spawn().map_err(|e| {
            self.log.line(format!("CMD ERROR {display}: {e}"));
            Error::configuration(format!("start command {display} error: {e}"))
        })?;
        let waited = tokio::select! {
            _ = self.cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = waited else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.log.line(format!("CMD CANCELED {display}"));
            return Err(Error::Canceled);
        };
        let status = status.map_err(|e| {
            Error::configuration(format!("wait command {display} error: {e}"))
        })?;
        if !status.success() {
            self.log.line(format!("CMD FAILED {display}: {status}"));
            return Err(Error::CommandFailed {
                command: display,
                status,
            });
        }
        self.log.line(format!("CMD DONE {display}"));
        Ok(())
    }

    /// Spawn a command with piped stdin/stdout for the external-tool
    /// control protocol; stderr keeps flowing into the task output file.
    pub(crate) fn spawn_controlled(
        &self,
        mut cmd: Command,
    ) -> Result<(tokio::process::Child, String)> {
        let display = command_display(&cmd);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        self.log.line(format!("CMD START {display}"));
        let child = cmd.spawn().map_err(|e| {
            self.log.line(format!("CMD ERROR {display}: {e}"));
            Error::configuration(format!("start command {display} error: {e}"))
        })?;
        Ok((child, display))
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Render a template with the `env`, `depout`, `depsrc` and `sh`
    /// helpers bound to this task.
    pub fn render(&self, template: &str) -> Result<String> {
        template::render(&template::HelperState::from_context(self), template)
    }

    /// Render a list of templates.
    pub fn render_all(&self, templates: &[String]) -> Result<Vec<String>> {
        let state = template::HelperState::from_context(self);
        templates
            .iter()
            .enumerate()
            .map(|(n, tpl)| {
                template::render(&state, tpl)
                    .map_err(|e| Error::Template(format!("rendering [{n}] error: {e}")))
            })
            .collect()
    }

    /// Render environment templates; the result is sorted so fingerprints
    /// stay deterministic.
    pub fn render_envs(&self, templates: &[String]) -> Result<Vec<String>> {
        let mut envs = self.render_all(templates)?;
        envs.sort();
        Ok(envs)
    }

    /// Find a direct dependency snapshot. Bare names are qualified with
    /// the current project.
    #[must_use]
    pub fn dep(&self, name: &str) -> Option<&DepHandle> {
        let mut tn = TargetName::split(name);
        if tn.project.is_empty() {
            tn.project = self.target.name.project.clone();
        }
        self.deps.iter().find(|d| d.direct && d.name == tn)
    }
}

/// The user's shell, falling back to `/bin/sh`.
#[must_use]
pub fn shell_program() -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => "/bin/sh".to_string(),
    }
}

pub(crate) fn command_display(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(
        std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned()),
    );
    format!("{parts:?}")
}
