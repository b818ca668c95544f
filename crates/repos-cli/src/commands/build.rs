//! `repos build TARGET...`

use std::sync::Arc;

use repos_core::{resolve_target_names, Repo};
use repos_engine::{plan, Dispatcher, Error, Result, TaskGraph, ToolRegistry};
use tokio_util::sync::CancellationToken;

use crate::printer::ProgressHandler;

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Mark the listed targets no-skip.
    pub force: bool,
    /// Do not echo task logs on failure.
    pub quiet: bool,
}

pub async fn execute(
    repo: &Repo,
    registry: &Arc<ToolRegistry>,
    cancel: &CancellationToken,
    patterns: &[String],
    options: BuildOptions,
) -> Result<()> {
    build_targets(repo, registry, cancel, patterns, options)
        .await
        .map(|_| ())
}

/// Plan and execute; returns the executed graph for callers that need
/// the produced outputs (`run`).
pub async fn build_targets(
    repo: &Repo,
    registry: &Arc<ToolRegistry>,
    cancel: &CancellationToken,
    patterns: &[String],
    options: BuildOptions,
) -> Result<TaskGraph> {
    let names = resolve_target_names(repo, patterns)?;
    tracing::debug!(?names, "resolved build targets");
    let mut graph = plan(repo, registry, &names)?;
    if options.force {
        for name in &names {
            if let Some(task) = graph.task_mut(name) {
                task.no_skip = true;
            }
        }
    }

    let dispatcher = Dispatcher::new(repo, Arc::clone(registry));
    let mut handler = ProgressHandler::new(repo, options.quiet);
    match dispatcher.run(&mut graph, cancel, &mut handler).await {
        Ok(()) => Ok(graph),
        Err(Error::SomeTasksFailed | Error::Incomplete) => Err(Error::configuration(
            "some tasks failed, use \"status|log TARGET\" to inspect the details",
        )),
        Err(Error::Canceled) => Err(Error::configuration("canceled")),
        Err(e) => Err(e),
    }
}
