//! Task graph construction and readiness tracking.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use repos_cache::OutputFiles;
use repos_core::{Repo, Target, TargetName};
use tracing::debug;

use crate::registry::ToolRegistry;
use crate::{Error, Result};

/// State of a task inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for dependencies.
    NotReady,
    /// All dependencies completed successfully; eligible for dispatch.
    Ready,
    /// Handed to the request channel.
    Queued,
    /// A worker is executing it.
    Running,
    /// Finished: success, skip or failure.
    Completed,
}

/// Terminal outcome of one task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Skipped,
    Failed(String),
}

/// The runtime shadow of a target in one build invocation.
#[derive(Debug)]
pub struct Task {
    pub target: Arc<Target>,
    /// Forbid skipping this specific task (`--force`).
    pub no_skip: bool,
    /// Direct dependencies, by global name.
    pub dep_on: BTreeSet<String>,
    /// Direct dependents, by global name.
    pub dep_by: BTreeSet<String>,
    deps_done: usize,
    pub state: TaskState,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    /// Outputs published by this run (or republished on skip).
    pub outputs: Option<OutputFiles>,
    pub outcome: Option<TaskOutcome>,
}

impl Task {
    fn new(target: Arc<Target>) -> Self {
        Self {
            target,
            no_skip: false,
            dep_on: BTreeSet::new(),
            dep_by: BTreeSet::new(),
            deps_done: 0,
            state: TaskState::NotReady,
            start_time: None,
            end_time: None,
            outputs: None,
            outcome: None,
        }
    }

    /// Global name of the underlying target.
    #[must_use]
    pub fn name(&self) -> String {
        self.target.global_name()
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        matches!(self.outcome, Some(TaskOutcome::Failed(_)))
    }

    #[must_use]
    pub fn skipped(&self) -> bool {
        matches!(self.outcome, Some(TaskOutcome::Skipped))
    }
}

/// A graph of tasks for one build invocation.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: BTreeMap<String, Task>,
    /// Tasks eligible for dispatch, in release order.
    pub ready: VecDeque<String>,
    /// Completed tasks, in completion order.
    pub completed: Vec<String>,
}

impl TaskGraph {
    /// Build a graph from required global target names, walking all
    /// transitive dependencies. Bare dependency names are qualified with
    /// the depending target's project.
    pub fn build(repo: &Repo, required: &[String]) -> Result<Self> {
        let mut graph = Self {
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            completed: Vec::new(),
        };

        let mut resolve: VecDeque<String> = VecDeque::new();
        for name in required {
            let tn = TargetName::split(name);
            if tn.project.is_empty() {
                return Err(Error::NotGlobalTargetName(name.clone()));
            }
            let target = repo
                .find_target(&tn)
                .ok_or_else(|| Error::UnknownTarget(tn.global()))?;
            if graph.add_target(target) {
                resolve.push_back(tn.global());
            }
        }

        while let Some(name) = resolve.pop_front() {
            let (project, deps) = {
                let task = &graph.tasks[&name];
                (task.target.name.project.clone(), task.target.deps.clone())
            };
            for dep in deps {
                let mut tn = TargetName::split(&dep);
                if tn.project.is_empty() {
                    tn.project = project.clone();
                }
                let dep_name = tn.global();
                let target = repo.find_target(&tn).ok_or_else(|| {
                    Error::UnknownDependency {
                        dep: dep.clone(),
                        target: name.clone(),
                    }
                })?;
                if graph.add_target(target) {
                    resolve.push_back(dep_name.clone());
                }
                graph
                    .tasks
                    .get_mut(&name)
                    .expect("task just visited")
                    .dep_on
                    .insert(dep_name.clone());
                graph
                    .tasks
                    .get_mut(&dep_name)
                    .expect("dep task just added")
                    .dep_by
                    .insert(name.clone());
            }
        }

        debug!(tasks = graph.tasks.len(), "task graph built");
        Ok(graph)
    }

    fn add_target(&mut self, target: &Arc<Target>) -> bool {
        let name = target.global_name();
        if self.tasks.contains_key(&name) {
            return false;
        }
        self.tasks.insert(name, Task::new(Arc::clone(target)));
        true
    }

    /// Prepare the graph for execution: seed the ready list with
    /// dependency-free tasks and simulate release order. The returned list
    /// names every task that can never be released, i.e. every task with
    /// at least one ancestor in a dependency cycle. Empty means acyclic.
    pub fn prepare(&mut self) -> Vec<String> {
        self.ready.clear();
        self.completed.clear();

        let mut releasing: VecDeque<String> = VecDeque::new();
        let mut not_released: BTreeSet<String> = BTreeSet::new();
        for (name, task) in &mut self.tasks {
            task.state = TaskState::NotReady;
            task.deps_done = 0;
            task.outcome = None;
            task.outputs = None;
            if task.dep_on.is_empty() {
                task.state = TaskState::Ready;
                self.ready.push_back(name.clone());
                releasing.push_back(name.clone());
            } else {
                not_released.insert(name.clone());
            }
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        while let Some(name) = releasing.pop_front() {
            let dependents: Vec<String> =
                self.tasks[&name].dep_by.iter().cloned().collect();
            for dependent in dependents {
                let count = counts.entry(dependent.clone()).or_insert(0);
                *count += 1;
                if *count >= self.tasks[&dependent].dep_on.len() {
                    counts.remove(&dependent);
                    releasing.push_back(dependent.clone());
                    not_released.remove(&dependent);
                }
            }
        }

        not_released.into_iter().collect()
    }

    /// Mark a task completed with its outcome and release dependents when
    /// it did not fail. Dependents of a failed task never become ready.
    pub fn complete(&mut self, name: &str, outcome: TaskOutcome) {
        let failed = matches!(outcome, TaskOutcome::Failed(_));
        let dependents: Vec<String> = {
            let task = self.tasks.get_mut(name).expect("completing known task");
            task.state = TaskState::Completed;
            task.outcome = Some(outcome);
            task.dep_by.iter().cloned().collect()
        };
        self.completed.push(name.to_string());
        if failed {
            return;
        }
        for dependent in dependents {
            let task = self.tasks.get_mut(&dependent).expect("dependent exists");
            task.deps_done += 1;
            if task.deps_done >= task.dep_on.len() {
                task.state = TaskState::Ready;
                self.ready.push_back(dependent);
            }
        }
    }

    /// All tasks completed or blocked forever?
    #[must_use]
    pub fn have_work_to_do(&self) -> bool {
        self.completed.len() < self.tasks.len()
    }

    #[must_use]
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.get_mut(name)
    }

    /// Iterate all tasks in name order.
    pub fn tasks(&self) -> impl Iterator<Item = (&String, &Task)> {
        self.tasks.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Transitive dependencies of a task in post-order (deepest first),
    /// each name once.
    #[must_use]
    pub fn transitive_deps(&self, name: &str) -> Vec<String> {
        let mut ordered = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(name.to_string());
        // Explicit stack; the second visit of a frame emits the node.
        let mut stack: Vec<(String, bool)> = self.tasks[name]
            .dep_on
            .iter()
            .rev()
            .map(|d| (d.clone(), false))
            .collect();
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                ordered.push(current);
                continue;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            stack.push((current.clone(), true));
            if let Some(task) = self.tasks.get(&current) {
                for dep in task.dep_on.iter().rev() {
                    stack.push((dep.clone(), false));
                }
            }
        }
        ordered
    }
}

/// Build, validate and prepare a graph for the required targets.
///
/// Validation covers the rules of every materialised target (a built-in
/// tool must accept its parameters; unknown tool names are deferred to
/// dynamic registration) and tool registrations (reserved names). A
/// non-empty cyclic set becomes [`Error::CyclicDependencies`].
pub fn plan(repo: &Repo, registry: &ToolRegistry, required: &[String]) -> Result<TaskGraph> {
    let mut graph = TaskGraph::build(repo, required)?;

    for (name, task) in graph.tasks() {
        if let Some(rule) = &task.target.rule {
            if let Some(tool) = registry.get(&rule.tool) {
                tool.create_executor(&task.target).map_err(|e| {
                    Error::configuration(format!(
                        "create tool for target {name:?} error: {e}"
                    ))
                })?;
            }
        }
        if let Some(reg) = &task.target.register_tool {
            if registry.contains(&reg.name) {
                return Err(Error::configuration(format!(
                    "target {name:?}: register-tool {:?} used a reserved name",
                    reg.name
                )));
            }
            for (n, tpl) in reg.env.iter().enumerate() {
                crate::template::validate(tpl).map_err(|e| {
                    Error::configuration(format!(
                        "target {name:?}: invalid register-tool.env[{n}]: {e}"
                    ))
                })?;
            }
            for (n, tpl) in reg.args.iter().enumerate() {
                crate::template::validate(tpl).map_err(|e| {
                    Error::configuration(format!(
                        "target {name:?}: invalid register-tool.args[{n}]: {e}"
                    ))
                })?;
            }
        }
    }

    let cyclic = graph.prepare();
    if !cyclic.is_empty() {
        return Err(Error::CyclicDependencies { tasks: cyclic });
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn diamond_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("REPOS.yaml"), "absolute-root: true\n");
        write(
            &root.join("proj/.repos/project.yaml"),
            r#"
name: proj
targets:
  a:
    deps: [b, c]
  b:
    deps: [d]
  c:
    deps: [d]
  d: {}
"#,
        );
        let mut repo = Repo::discover(Some(root)).unwrap();
        repo.load_projects().unwrap();
        (dir, repo)
    }

    #[test]
    fn builds_diamond_with_shared_dep_once() {
        let (_dir, repo) = diamond_repo();
        let graph = TaskGraph::build(&repo, &["proj:a".to_string()]).unwrap();
        assert_eq!(graph.len(), 4);
        let a = graph.task("proj:a").unwrap();
        assert_eq!(a.dep_on.len(), 2);
        let d = graph.task("proj:d").unwrap();
        assert_eq!(d.dep_by.len(), 2);
    }

    #[test]
    fn prepare_seeds_ready_with_leaf_tasks() {
        let (_dir, repo) = diamond_repo();
        let mut graph = TaskGraph::build(&repo, &["proj:a".to_string()]).unwrap();
        let cyclic = graph.prepare();
        assert!(cyclic.is_empty());
        assert_eq!(graph.ready, vec!["proj:d".to_string()]);
    }

    #[test]
    fn complete_releases_dependents() {
        let (_dir, repo) = diamond_repo();
        let mut graph = TaskGraph::build(&repo, &["proj:a".to_string()]).unwrap();
        graph.prepare();

        graph.ready.pop_front();
        graph.complete("proj:d", TaskOutcome::Success);
        let ready: Vec<_> = graph.ready.iter().cloned().collect();
        assert_eq!(ready, vec!["proj:b", "proj:c"]);

        graph.ready.clear();
        graph.complete("proj:b", TaskOutcome::Success);
        assert!(graph.ready.is_empty());
        graph.complete("proj:c", TaskOutcome::Skipped);
        assert_eq!(graph.ready, vec!["proj:a".to_string()]);
    }

    #[test]
    fn failed_task_never_releases_dependents() {
        let (_dir, repo) = diamond_repo();
        let mut graph = TaskGraph::build(&repo, &["proj:a".to_string()]).unwrap();
        graph.prepare();

        graph.ready.pop_front();
        graph.complete("proj:d", TaskOutcome::Failed("boom".into()));
        assert!(graph.ready.is_empty());
        assert!(graph.have_work_to_do());
        assert!(graph.task("proj:d").unwrap().failed());
    }

    #[test]
    fn cycle_is_reported_with_all_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("REPOS.yaml"), "absolute-root: true\n");
        write(
            &root.join("proj/.repos/project.yaml"),
            "name: proj\ntargets:\n  a:\n    deps: [b]\n  b:\n    deps: [c]\n  c:\n    deps: [a]\n",
        );
        let mut repo = Repo::discover(Some(root)).unwrap();
        repo.load_projects().unwrap();

        let registry = ToolRegistry::builtin();
        let err = plan(&repo, &registry, &["proj:a".to_string()]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cyclic dependencies"));
        for name in ["proj:a", "proj:b", "proj:c"] {
            assert!(msg.contains(name), "missing {name} in {msg}");
        }
    }

    #[test]
    fn unknown_dependency_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("REPOS.yaml"), "absolute-root: true\n");
        write(
            &root.join("proj/.repos/project.yaml"),
            "name: proj\ntargets:\n  a:\n    deps: [ghost]\n",
        );
        let mut repo = Repo::discover(Some(root)).unwrap();
        repo.load_projects().unwrap();
        let err = TaskGraph::build(&repo, &["proj:a".to_string()]).unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
    }

    #[test]
    fn dependencies_qualify_with_own_project() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("REPOS.yaml"), "absolute-root: true\n");
        write(
            &root.join("one/.repos/project.yaml"),
            "name: one\ntargets:\n  app:\n    deps: [lib, 'two:lib']\n  lib: {}\n",
        );
        write(
            &root.join("two/.repos/project.yaml"),
            "name: two\ntargets:\n  lib: {}\n",
        );
        let mut repo = Repo::discover(Some(root)).unwrap();
        repo.load_projects().unwrap();
        let graph = TaskGraph::build(&repo, &["one:app".to_string()]).unwrap();
        let app = graph.task("one:app").unwrap();
        assert!(app.dep_on.contains("one:lib"));
        assert!(app.dep_on.contains("two:lib"));
    }

    #[test]
    fn requires_global_names() {
        let (_dir, repo) = diamond_repo();
        let err = TaskGraph::build(&repo, &["a".to_string()]).unwrap_err();
        assert!(matches!(err, Error::NotGlobalTargetName(_)));
    }

    #[test]
    fn transitive_deps_are_post_order() {
        let (_dir, repo) = diamond_repo();
        let graph = TaskGraph::build(&repo, &["proj:a".to_string()]).unwrap();
        let deps = graph.transitive_deps("proj:a");
        // d appears exactly once and before both b and c.
        assert_eq!(deps.iter().filter(|d| *d == "proj:d").count(), 1);
        let pos = |n: &str| deps.iter().position(|d| d == n).unwrap();
        assert!(pos("proj:d") < pos("proj:b"));
        assert!(pos("proj:d") < pos("proj:c"));
        assert_eq!(deps.len(), 3);
    }
}
