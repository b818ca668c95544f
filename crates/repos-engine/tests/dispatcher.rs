//! End-to-end dispatcher scenarios over a real on-disk repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use repos_core::Repo;
use repos_engine::{
    plan, Dispatcher, DispatcherEvent, Error, EventHandler, TaskGraph, ToolRegistry,
};
use tokio_util::sync::CancellationToken;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn bump_mtime(path: &Path) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}

/// Collects the event stream for ordering assertions.
#[derive(Default)]
struct EventLog {
    entries: Vec<String>,
}

impl EventHandler for EventLog {
    fn handle_event(&mut self, _graph: &TaskGraph, event: &DispatcherEvent) {
        let entry = match event {
            DispatcherEvent::DispatcherStart { num_workers } => {
                format!("start workers={num_workers}")
            }
            DispatcherEvent::DispatcherEnd { error } => match error {
                Some(e) => format!("end err={e}"),
                None => "end".to_string(),
            },
            DispatcherEvent::TaskStart { task, .. } => format!("+{task}"),
            DispatcherEvent::TaskComplete { task } => format!("-{task}"),
        };
        self.entries.push(entry);
    }
}

impl EventLog {
    fn position(&self, entry: &str) -> usize {
        self.entries
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("missing event {entry:?} in {:?}", self.entries))
    }
}

/// A diamond of exec targets: a -> {b, c} -> d.
fn diamond_fixture() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    write(&root.join("REPOS.yaml"), "absolute-root: true\n");
    write(&root.join("app/d.txt"), "dee\n");
    write(&root.join("app/b.txt"), "bee\n");
    write(&root.join("app/c.txt"), "cee\n");
    write(
        &root.join("app/.repos/project.yaml"),
        r#"
name: app
targets:
  d:
    rule:
      exec:
        srcs: [d.txt]
        out: d.out
        command: 'cp d.txt "$REPOS_OUTPUT_DIR"/d.out'
  b:
    deps: [d]
    rule:
      exec:
        srcs: [b.txt]
        out: b.out
        command: 'cat {{depout "d"}} b.txt > "$REPOS_OUTPUT_DIR"/b.out'
  c:
    deps: [d]
    rule:
      exec:
        srcs: [c.txt]
        out: c.out
        command: 'cat {{depout "d"}} c.txt > "$REPOS_OUTPUT_DIR"/c.out'
  a:
    deps: [b, c]
    rule:
      exec:
        out: a.out
        command: 'cat {{depout "b"}} {{depout "c"}} > "$REPOS_OUTPUT_DIR"/a.out'
"#,
    );
    (dir, root)
}

fn load_repo(root: &Path) -> Repo {
    let mut repo = Repo::discover(Some(root)).unwrap();
    repo.load_projects().unwrap();
    repo
}

async fn build(
    repo: &Repo,
    targets: &[&str],
    force: &[&str],
    workers: usize,
) -> (TaskGraph, EventLog, Result<(), Error>) {
    let registry = Arc::new(ToolRegistry::builtin());
    let names: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
    let mut graph = plan(repo, &registry, &names).unwrap();
    for name in force {
        graph.task_mut(name).unwrap().no_skip = true;
    }
    let dispatcher = Dispatcher::new(repo, registry).with_workers(workers);
    let mut events = EventLog::default();
    let cancel = CancellationToken::new();
    let result = dispatcher.run(&mut graph, &cancel, &mut events).await;
    (graph, events, result)
}

#[tokio::test]
async fn diamond_executes_in_dependency_order_then_skips() {
    let (_dir, root) = diamond_fixture();
    let repo = load_repo(&root);

    let (graph, events, result) = build(&repo, &["app:a"], &[], 4).await;
    result.unwrap();

    // Four starts, four completions.
    for t in ["app:a", "app:b", "app:c", "app:d"] {
        assert!(events.entries.contains(&format!("+{t}")));
        assert!(events.entries.contains(&format!("-{t}")));
        assert!(
            !graph.task(t).unwrap().skipped(),
            "{t} must execute on first build"
        );
    }
    // Dependency ordering on the event stream.
    assert!(events.position("-app:d") < events.position("+app:b"));
    assert!(events.position("-app:d") < events.position("+app:c"));
    assert!(events.position("-app:b") < events.position("+app:a"));
    assert!(events.position("-app:c") < events.position("+app:a"));

    let out = std::fs::read_to_string(
        root.join(".repos_data/out/app/a.out"),
    )
    .unwrap();
    assert_eq!(out, "dee\nbee\ndee\ncee\n");

    // Second build with no changes: every task skips, outputs survive.
    let (graph, _events, result) = build(&repo, &["app:a"], &[], 4).await;
    result.unwrap();
    for t in ["app:a", "app:b", "app:c", "app:d"] {
        assert!(graph.task(t).unwrap().skipped(), "{t} must skip");
    }
    let a = graph.task("app:a").unwrap();
    assert_eq!(a.outputs.as_ref().unwrap().primary, "a.out");
}

#[tokio::test]
async fn touching_leaf_source_rebuilds_descendants() {
    let (_dir, root) = diamond_fixture();
    let repo = load_repo(&root);

    build(&repo, &["app:a"], &[], 4).await.2.unwrap();
    bump_mtime(&root.join("app/d.txt"));

    let (graph, _events, result) = build(&repo, &["app:a"], &[], 4).await;
    result.unwrap();
    for t in ["app:a", "app:b", "app:c", "app:d"] {
        assert!(!graph.task(t).unwrap().skipped(), "{t} must re-execute");
    }
}

#[tokio::test]
async fn force_rebuild_propagates_to_dependents() {
    let (_dir, root) = diamond_fixture();
    let repo = load_repo(&root);

    build(&repo, &["app:a"], &[], 4).await.2.unwrap();

    let (graph, _events, result) = build(&repo, &["app:a"], &["app:d"], 4).await;
    result.unwrap();
    for t in ["app:a", "app:b", "app:c", "app:d"] {
        assert!(
            !graph.task(t).unwrap().skipped(),
            "{t} must re-execute under --force of d"
        );
    }
}

#[tokio::test]
async fn single_worker_never_overlaps_tasks() {
    let (_dir, root) = diamond_fixture();
    let repo = load_repo(&root);

    let (_graph, events, result) = build(&repo, &["app:a"], &[], 1).await;
    result.unwrap();

    let mut running: Option<&str> = None;
    for entry in &events.entries {
        if let Some(task) = entry.strip_prefix('+') {
            assert!(
                running.is_none(),
                "task {task} started while {running:?} was running"
            );
            running = Some(task);
        } else if let Some(task) = entry.strip_prefix('-') {
            // Completion may only name the running task.
            if let Some(current) = running {
                assert_eq!(current, task);
            }
            running = None;
        }
    }
}

#[tokio::test]
async fn failing_task_blocks_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("REPOS.yaml"), "absolute-root: true\n");
    write(
        &root.join("app/.repos/project.yaml"),
        r#"
name: app
targets:
  bad:
    rule:
      exec:
        command: 'exit 7'
  top:
    deps: [bad]
    rule:
      exec:
        out: top.out
        command: 'touch "$REPOS_OUTPUT_DIR"/top.out'
"#,
    );
    let repo = load_repo(root);

    let (graph, events, result) = build(&repo, &["app:top"], &[], 2).await;
    assert!(matches!(result, Err(Error::SomeTasksFailed)));
    assert!(graph.task("app:bad").unwrap().failed());
    assert!(!events.entries.contains(&"+app:top".to_string()));
    // The failure is persisted for `status`.
    let saved = repos_cache::TaskResult::load(&repos_cache::result_file(
        &repo.cache_dir(),
        "app:bad",
    ))
    .unwrap();
    assert!(saved.error.is_some());
}

#[tokio::test]
async fn external_protocol_tool_skips_via_control_channel() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("REPOS.yaml"), "absolute-root: true\n");
    write(&root.join("app/src.txt"), "payload\n");
    write(
        &root.join("app/tool.sh"),
        r#"#!/bin/sh
echo "Ssrc.txt"
echo "Oout.bin"
echo "Pv1"
echo "V"
read answer
if [ "$answer" = "1" ]; then
  echo "X"
  exit 0
fi
mkdir -p "$REPOS_OUTPUT_DIR"
cp src.txt "$REPOS_OUTPUT_DIR/out.bin"
"#,
    );
    write(
        &root.join("app/.repos/project.yaml"),
        r#"
name: app
targets:
  pack:
    rule:
      ext:
        command: 'sh tool.sh'
"#,
    );
    let repo = load_repo(root);

    let (graph, _events, result) = build(&repo, &["app:pack"], &[], 2).await;
    result.unwrap();
    let pack = graph.task("app:pack").unwrap();
    assert!(!pack.skipped());
    assert_eq!(pack.outputs.as_ref().unwrap().primary, "out.bin");
    assert!(root.join(".repos_data/out/app/out.bin").exists());

    // Second run: saved state matches, engine answers 1, tool exits via X.
    let (graph, _events, result) = build(&repo, &["app:pack"], &[], 2).await;
    result.unwrap();
    let pack = graph.task("app:pack").unwrap();
    assert!(pack.skipped());
    assert_eq!(
        pack.outputs.as_ref().unwrap().primary,
        "out.bin",
        "skip republishes saved outputs"
    );
}

#[tokio::test]
async fn registered_tool_runs_dependent_target() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("REPOS.yaml"), "absolute-root: true\n");
    write(
        &root.join("app/gen.sh"),
        r#"#!/bin/sh
echo "Pmode=$REPOS_TOOL_PARAM_mode"
echo "Ogen.out"
mkdir -p "$REPOS_OUTPUT_DIR"
printf '%s' "$REPOS_TOOL_PARAM_mode" > "$REPOS_OUTPUT_DIR/gen.out"
"#,
    );
    write(
        &root.join("app/.repos/project.yaml"),
        r#"
name: app
targets:
  toolsrc:
    register-tool:
      name: mygen
      src: gen.sh
      shell-script: true
    rule:
      files:
        srcs: [gen.sh]
  use:
    deps: [toolsrc]
    rule:
      mygen:
        mode: fast
"#,
    );
    let repo = load_repo(root);

    let (graph, _events, result) = build(&repo, &["app:use"], &[], 2).await;
    result.unwrap();
    assert!(!graph.task("app:use").unwrap().failed());
    let content =
        std::fs::read_to_string(root.join(".repos_data/out/app/gen.out")).unwrap();
    assert_eq!(content, "fast");
}

#[tokio::test]
async fn cancelled_token_aborts_before_work() {
    let (_dir, root) = diamond_fixture();
    let repo = load_repo(&root);

    let registry = Arc::new(ToolRegistry::builtin());
    let mut graph = plan(&repo, &registry, &["app:a".to_string()]).unwrap();
    let dispatcher = Dispatcher::new(&repo, registry).with_workers(2);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut events = EventLog::default();
    let result = dispatcher.run(&mut graph, &cancel, &mut events).await;
    assert!(matches!(result, Err(Error::Canceled)));
    assert!(!root.join(".repos_data/out/app/a.out").exists());
}
