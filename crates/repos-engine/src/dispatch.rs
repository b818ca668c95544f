//! The dispatcher: a bounded worker pool driven by a single coordinator.
//!
//! The coordinator owns the task graph. Workers receive self-contained
//! work items over a bounded request channel and report completions over
//! a result channel; task state is only ever mutated by the coordinator,
//! which is also the single point where events reach the handler.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use repos_cache::{result_file, unix_nanos, OutputFiles, TaskResult};
use repos_core::{LogFile, Repo, Target};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::{DepHandle, ExecContext, ExecContextParams};
use crate::events::{DispatcherEvent, EventHandler};
use crate::graph::{TaskGraph, TaskOutcome, TaskState};
use crate::registry::{ToolExecutor, ToolRegistry};
use crate::tools::external::ExtTool;
use crate::{Error, ExecStatus, Result};

/// A task handed to a worker, self-contained so the worker never touches
/// the graph.
struct WorkItem {
    name: String,
    target: Arc<Target>,
    no_skip: bool,
    /// Transitive dependency snapshots in post-order, direct ones flagged.
    deps: Arc<Vec<DepHandle>>,
}

/// What a worker reports back for one task.
struct TaskCompletion {
    name: String,
    start: SystemTime,
    end: SystemTime,
    outcome: TaskOutcome,
    outputs: Option<OutputFiles>,
}

/// Paths and registries shared by all workers of one run.
struct WorkerShared {
    root_dir: PathBuf,
    meta_folder: String,
    out_base: PathBuf,
    cache_dir: PathBuf,
    log_dir: PathBuf,
    registry: Arc<ToolRegistry>,
    ext_tools: Arc<RwLock<BTreeMap<String, ExtTool>>>,
    log: LogFile,
    cancel: CancellationToken,
}

/// Executes a prepared task graph across a pool of workers.
pub struct Dispatcher {
    /// Worker count; zero means the machine's logical CPU count.
    pub num_workers: usize,
    root_dir: PathBuf,
    meta_folder: String,
    out_base: PathBuf,
    cache_dir: PathBuf,
    log_dir: PathBuf,
    registry: Arc<ToolRegistry>,
    ext_tools: Arc<RwLock<BTreeMap<String, ExtTool>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(repo: &Repo, registry: Arc<ToolRegistry>) -> Self {
        Self {
            num_workers: 0,
            root_dir: repo.root_dir.clone(),
            meta_folder: repo.meta_folder().to_string(),
            out_base: repo.out_dir(),
            cache_dir: repo.cache_dir(),
            log_dir: repo.log_dir(),
            registry,
            ext_tools: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    #[must_use]
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    fn effective_workers(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1)
    }

    /// Execute all tasks of a prepared graph.
    ///
    /// Returns `Ok(())` when every task completed without failure;
    /// [`Error::SomeTasksFailed`] when any task failed,
    /// [`Error::Incomplete`] when tasks remain but no progress is
    /// possible, and [`Error::Canceled`] on cancellation.
    pub async fn run(
        &self,
        graph: &mut TaskGraph,
        cancel: &CancellationToken,
        handler: &mut dyn EventHandler,
    ) -> Result<()> {
        let num_workers = self.effective_workers();
        for dir in [&self.log_dir, &self.cache_dir, &self.out_base] {
            std::fs::create_dir_all(dir).map_err(|e| Error::io(e, dir.clone(), "create"))?;
        }
        let run_log = LogFile::create(&self.log_dir.join("_.log"))?;

        let (request_tx, request_rx) = mpsc::channel::<WorkItem>(num_workers);
        let (result_tx, mut result_rx) = mpsc::channel::<TaskCompletion>(num_workers);
        let (event_tx, mut event_rx) = mpsc::channel::<DispatcherEvent>(num_workers);
        let request_rx = Arc::new(tokio::sync::Mutex::new(request_rx));

        let worker_cancel = cancel.child_token();
        let shared = Arc::new(WorkerShared {
            root_dir: self.root_dir.clone(),
            meta_folder: self.meta_folder.clone(),
            out_base: self.out_base.clone(),
            cache_dir: self.cache_dir.clone(),
            log_dir: self.log_dir.clone(),
            registry: Arc::clone(&self.registry),
            ext_tools: Arc::clone(&self.ext_tools),
            log: run_log.clone(),
            cancel: worker_cancel.clone(),
        });

        let mut workers = JoinSet::new();
        for index in 0..num_workers {
            workers.spawn(run_worker(
                index,
                Arc::clone(&request_rx),
                result_tx.clone(),
                event_tx.clone(),
                Arc::clone(&shared),
            ));
        }
        drop(result_tx);
        drop(event_tx);

        handler.handle_event(graph, &DispatcherEvent::DispatcherStart { num_workers });
        run_log.line(format!("{num_workers} workers started"));

        let mut running = 0usize;
        let mut error: Option<Error> = None;

        'main: while graph.have_work_to_do() {
            while running < num_workers {
                let Some(name) = graph.ready.pop_front() else {
                    break;
                };
                let item = work_item(graph, &name);
                graph
                    .task_mut(&name)
                    .expect("ready task exists")
                    .state = TaskState::Queued;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let task = graph.task_mut(&name).expect("ready task exists");
                        task.state = TaskState::Ready;
                        graph.ready.push_front(name);
                        error = Some(Error::Canceled);
                        break 'main;
                    }
                    permit = request_tx.reserve() => match permit {
                        Ok(permit) => {
                            permit.send(item);
                            running += 1;
                            run_log.line(format!("Enqueued task {name}"));
                        }
                        Err(_) => {
                            let task = graph.task_mut(&name).expect("ready task exists");
                            task.state = TaskState::Ready;
                            graph.ready.push_front(name);
                            error = Some(Error::configuration("request channel closed"));
                            break 'main;
                        }
                    }
                }
            }

            if running == 0 {
                // Remaining tasks are all blocked by failures.
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    error = Some(Error::Canceled);
                    break 'main;
                }
                event = event_rx.recv() => {
                    if let Some(event) = event {
                        forward_event(graph, handler, event);
                    }
                }
                completion = result_rx.recv() => {
                    if let Some(completion) = completion {
                        running -= 1;
                        apply_completion(graph, handler, &run_log, completion);
                    }
                }
            }
        }

        run_log.line("Stopping workers");
        worker_cancel.cancel();
        drop(request_tx);
        while workers.join_next().await.is_some() {}

        // Tasks queued but never picked up go back to the ready list.
        {
            let mut rx = request_rx.lock().await;
            while let Ok(item) = rx.try_recv() {
                if let Some(task) = graph.task_mut(&item.name) {
                    task.state = TaskState::Ready;
                }
                graph.ready.push_front(item.name);
            }
        }
        // Buffered events and results are still processed.
        while let Some(event) = event_rx.recv().await {
            forward_event(graph, handler, event);
        }
        while let Some(completion) = result_rx.recv().await {
            apply_completion(graph, handler, &run_log, completion);
        }
        run_log.line("All workers stopped");

        if error.is_none() {
            if graph.tasks().any(|(_, task)| task.failed()) {
                error = Some(Error::SomeTasksFailed);
            } else if graph.have_work_to_do() {
                error = Some(Error::Incomplete);
            }
        }
        handler.handle_event(
            graph,
            &DispatcherEvent::DispatcherEnd {
                error: error.as_ref().map(ToString::to_string),
            },
        );
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn work_item(graph: &TaskGraph, name: &str) -> WorkItem {
    let task = graph.task(name).expect("ready task exists");
    let mut deps = Vec::new();
    for dep_name in graph.transitive_deps(name) {
        let dep = graph.task(&dep_name).expect("dependency exists");
        deps.push(DepHandle {
            name: dep.target.name.clone(),
            direct: task.dep_on.contains(&dep_name),
            skipped: dep.skipped(),
            outputs: dep.outputs.clone(),
            project_dir: dep.target.project_dir.clone(),
        });
    }
    WorkItem {
        name: name.to_string(),
        target: Arc::clone(&task.target),
        no_skip: task.no_skip,
        deps: Arc::new(deps),
    }
}

fn forward_event(graph: &mut TaskGraph, handler: &mut dyn EventHandler, event: DispatcherEvent) {
    if let DispatcherEvent::TaskStart { task, .. } = &event {
        if let Some(task) = graph.task_mut(task) {
            if task.state == TaskState::Queued {
                task.state = TaskState::Running;
            }
        }
    }
    handler.handle_event(graph, &event);
}

fn apply_completion(
    graph: &mut TaskGraph,
    handler: &mut dyn EventHandler,
    run_log: &LogFile,
    completion: TaskCompletion,
) {
    let name = completion.name;
    {
        let task = graph.task_mut(&name).expect("completed task exists");
        task.start_time = Some(completion.start);
        task.end_time = Some(completion.end);
        task.outputs = completion.outputs;
    }
    match &completion.outcome {
        TaskOutcome::Failed(msg) => {
            run_log.line(format!("Completed task {name}, err: {msg}"))
        }
        TaskOutcome::Skipped => run_log.line(format!("Completed task {name} (skipped)")),
        TaskOutcome::Success => run_log.line(format!("Completed task {name}")),
    }
    graph.complete(&name, completion.outcome);
    handler.handle_event(graph, &DispatcherEvent::TaskComplete { task: name });
}

async fn run_worker(
    index: usize,
    request_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    result_tx: mpsc::Sender<TaskCompletion>,
    event_tx: mpsc::Sender<DispatcherEvent>,
    shared: Arc<WorkerShared>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            received = async { request_rx.lock().await.recv().await } => {
                match received {
                    Some(item) => item,
                    None => return,
                }
            }
        };
        let name = item.name.clone();
        shared.log.line(format!("Worker {index} start task {name}"));
        let start = SystemTime::now();
        if event_tx
            .send(DispatcherEvent::TaskStart {
                task: name.clone(),
                worker: index,
            })
            .await
            .is_err()
        {
            return;
        }

        let (mut result, status, outputs) = execute_task(&item, index, &shared).await;
        let end = SystemTime::now();

        result.start_time = unix_nanos(start);
        result.end_time = unix_nanos(end);
        let outcome = match status {
            Ok(ExecStatus::Completed) => {
                result.skipped = false;
                result.error = None;
                result.success_build_start_time = result.start_time;
                result.success_build_end_time = result.end_time;
                TaskOutcome::Success
            }
            Ok(ExecStatus::Skipped) => {
                result.skipped = true;
                result.error = None;
                TaskOutcome::Skipped
            }
            Err(e) => {
                let msg = e.to_string();
                result.skipped = false;
                result.error = Some(msg.clone());
                TaskOutcome::Failed(msg)
            }
        };
        if let Err(e) = result.store(&result_file(&shared.cache_dir, &name)) {
            shared.log.line(format!("WriteResult {name:?} error: {e}"));
        }
        shared
            .log
            .line(format!("Worker {index} complete task {name}"));

        if result_tx
            .send(TaskCompletion {
                name,
                start,
                end,
                outcome,
                outputs,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

/// The skippability gate plus executor invocation.
async fn execute_task(
    item: &WorkItem,
    worker: usize,
    shared: &Arc<WorkerShared>,
) -> (TaskResult, Result<ExecStatus>, Option<OutputFiles>) {
    let name = &item.name;
    let prior = TaskResult::load_or_default(&result_file(&shared.cache_dir, name));

    let mut skippable = !item.target.always && !item.no_skip;
    if skippable && !prior.has_success() {
        shared
            .log
            .line(format!("{name}: NotSkippable: no previous successful build."));
        skippable = false;
    }
    if skippable {
        for dep in item.deps.iter().filter(|d| d.direct) {
            let dep_name = dep.name.global();
            if !dep.skipped {
                shared
                    .log
                    .line(format!("{name}: NotSkippable: dep {dep_name} not skipped."));
                skippable = false;
                break;
            }
            let dep_result =
                TaskResult::load_or_default(&result_file(&shared.cache_dir, &dep_name));
            if !dep_result.has_success() {
                shared.log.line(format!(
                    "{name}: NotSkippable: dep {dep_name} has no successful build."
                ));
                skippable = false;
                break;
            }
            if dep_result.success_build_start_time > prior.success_build_start_time
                || dep_result.success_build_end_time > prior.success_build_start_time
            {
                shared.log.line(format!(
                    "{name}: NotSkippable: dep {dep_name} is newer than current task."
                ));
                skippable = false;
                break;
            }
        }
    }

    let executor: Box<dyn ToolExecutor> = match &item.target.rule {
        None => {
            // Dummy target: aggregates dependencies, performs no work.
            let status = if skippable {
                ExecStatus::Skipped
            } else {
                ExecStatus::Completed
            };
            return (prior, Ok(status), None);
        }
        Some(rule) => {
            let created = match shared.registry.get(&rule.tool) {
                Some(tool) => tool.create_executor(&item.target),
                None => {
                    let ext = {
                        let tools = shared.ext_tools.read().unwrap_or_else(|e| e.into_inner());
                        tools.get(&rule.tool).cloned()
                    };
                    match ext {
                        Some(ext) => ext.create_executor(&item.target),
                        None => return (prior, Err(Error::UnknownTool(rule.tool.clone())), None),
                    }
                }
            };
            match created {
                Ok(executor) => executor,
                Err(e) => {
                    let e = Error::configuration(format!(
                        "create tool {:?} error: {e}",
                        rule.tool
                    ));
                    return (prior, Err(e), None);
                }
            }
        }
    };

    // A fresh execution is about to happen; a stale result from an
    // interrupted run must not look current afterwards.
    let _ = std::fs::remove_file(result_file(&shared.cache_dir, name));

    let out_dir = shared.out_base.join(&item.target.project_dir);
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        return (prior, Err(Error::io(e, out_dir, "create")), None);
    }
    let log_path = shared.log_dir.join(format!("{name}.log"));
    let task_log = match LogFile::create(&log_path) {
        Ok(log) => log,
        Err(e) => return (prior, Err(e.into()), None),
    };
    let out_path = shared.log_dir.join(format!("{name}.out"));
    let out_file = match std::fs::File::create(&out_path) {
        Ok(file) => file,
        Err(e) => return (prior, Err(Error::io(e, out_path, "create")), None),
    };

    let tool_name = item
        .target
        .rule
        .as_ref()
        .map(|r| r.tool.clone())
        .unwrap_or_default();
    let mut ctx = ExecContext::new(ExecContextParams {
        task_name: name.clone(),
        target: Arc::clone(&item.target),
        worker,
        root_dir: shared.root_dir.clone(),
        meta_folder: shared.meta_folder.clone(),
        out_base: shared.out_base.clone(),
        cache_dir: shared.cache_dir.clone(),
        skippable,
        log: task_log.with_prefix(tool_name),
        deps: Arc::clone(&item.deps),
        out_file,
        cancel: shared.cancel.clone(),
    });

    debug!(task = %name, worker, skippable, "executing task");
    let status = match executor.execute(&mut ctx).await {
        Ok(status) => status,
        Err(e) => return (prior, Err(e), ctx.take_outputs()),
    };
    if status == ExecStatus::Skipped && ctx.outputs().is_none() {
        if let Some(saved) = ctx.load_saved_outputs() {
            ctx.publish_outputs(saved);
        }
    }
    if let Err(e) = register_tool_if_requested(&ctx, shared) {
        return (prior, Err(e), ctx.take_outputs());
    }
    let outputs = ctx.take_outputs();
    (prior, Ok(status), outputs)
}

/// After a successful (or skipped) run, register the external tool the
/// target declares, pointing at its own output or a source script.
fn register_tool_if_requested(ctx: &ExecContext, shared: &Arc<WorkerShared>) -> Result<()> {
    let Some(reg) = &ctx.target.register_tool else {
        return Ok(());
    };
    let executable = if !reg.src.is_empty() {
        ctx.source_dir().join(&reg.src)
    } else {
        let outputs = ctx.outputs().ok_or_else(|| {
            Error::configuration(format!(
                "register-tool {:?} no outputs from task",
                reg.name
            ))
        })?;
        let out = if reg.out.is_empty() {
            outputs.primary.as_str()
        } else {
            outputs.extra.get(&reg.out).map(String::as_str).unwrap_or("")
        };
        if out.is_empty() {
            return Err(Error::configuration(format!(
                "register-tool {:?} output not found",
                reg.name
            )));
        }
        ctx.out_dir.join(out)
    };
    let envs = ctx
        .render_envs(&reg.env)
        .map_err(|e| Error::configuration(format!("register-tool {:?} envs: {e}", reg.name)))?;
    let args = ctx
        .render_all(&reg.args)
        .map_err(|e| Error::configuration(format!("register-tool {:?} args: {e}", reg.name)))?;

    let tool = ExtTool {
        task: ctx.task_name.clone(),
        executable,
        shell_script: reg.shell_script,
        envs,
        args,
    };
    let mut tools = shared.ext_tools.write().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = tools.get(&reg.name) {
        return Err(Error::configuration(format!(
            "register-tool {:?} already registered by {:?}",
            reg.name, existing.task
        )));
    }
    tools.insert(reg.name.clone(), tool);
    ctx.log
        .line(format!("Tool {:?} registered by {:?}", reg.name, ctx.task_name));
    Ok(())
}
