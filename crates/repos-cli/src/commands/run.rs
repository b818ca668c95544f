//! `repos run TARGET ARGS...` — build a target, then execute its primary
//! output with the shared library paths of its dependencies.

use std::path::PathBuf;
use std::sync::Arc;

use repos_core::Repo;
use repos_engine::{Error, Result, TaskGraph, ToolRegistry};
use tokio_util::sync::CancellationToken;

use crate::commands::build::{build_targets, BuildOptions};
use crate::commands::match_one_target;

pub async fn execute(
    repo: &Repo,
    registry: &Arc<ToolRegistry>,
    cancel: &CancellationToken,
    pattern: &str,
    args: &[String],
) -> Result<i32> {
    let target = match_one_target(repo, pattern)?;
    let name = target.global_name();
    let graph = build_targets(
        repo,
        registry,
        cancel,
        &[name.clone()],
        BuildOptions::default(),
    )
    .await?;

    let task = graph.task(&name).expect("built task exists");
    let primary = task
        .outputs
        .as_ref()
        .map(|o| o.primary.as_str())
        .unwrap_or("");
    if primary.is_empty() {
        return Err(Error::configuration("no output"));
    }

    let out_base = repo.out_dir();
    let lib_dirs = shared_lib_dirs(&graph, &name, &out_base);
    let exec_path = out_base.join(&target.project_dir).join(primary);

    let mut cmd = std::process::Command::new(&exec_path);
    cmd.args(args);
    if !lib_dirs.is_empty() {
        let mut path = lib_dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        if let Ok(existing) = std::env::var("LD_LIBRARY_PATH") {
            if !existing.is_empty() {
                path = format!("{path}:{existing}");
            }
        }
        cmd.env("LD_LIBRARY_PATH", path);
    }
    let status = cmd.status().map_err(|e| {
        Error::configuration(format!("execute {:?} error: {e}", exec_path.display()))
    })?;
    Ok(status.code().unwrap_or(1))
}

/// `SHARED_LIB_DIR` outputs across the transitive dependency closure,
/// dependencies first, the target itself last.
fn shared_lib_dirs(graph: &TaskGraph, name: &str, out_base: &std::path::Path) -> Vec<PathBuf> {
    let mut names = graph.transitive_deps(name);
    names.push(name.to_string());

    let mut dirs = Vec::new();
    for task_name in names {
        let Some(task) = graph.task(&task_name) else {
            continue;
        };
        let Some(outputs) = &task.outputs else {
            continue;
        };
        if let Some(dir) = outputs.extra.get("SHARED_LIB_DIR") {
            let dir = out_base
                .join(&task.target.project_dir)
                .join(dir.trim_end_matches('/'));
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }
    dirs
}
