//! Plain-text progress output.
//!
//! The engine reports through the event handler; this printer writes one
//! line per transition. There is no animated terminal display; `--script`
//! keeps the same output stable for machine consumption.

use std::path::PathBuf;
use std::time::SystemTime;

use repos_core::Repo;
use repos_engine::{DispatcherEvent, EventHandler, TaskGraph, TaskOutcome};

/// Prints dispatcher events and echoes failed task logs.
pub struct ProgressHandler {
    log_dir: PathBuf,
    quiet: bool,
}

impl ProgressHandler {
    #[must_use]
    pub fn new(repo: &Repo, quiet: bool) -> Self {
        Self {
            log_dir: repo.log_dir(),
            quiet,
        }
    }

    fn echo_task_log(&self, task: &str) {
        let path = self.log_dir.join(format!("{task}.out"));
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.is_empty() => {
                println!("---- {task} output ----");
                print!("{content}");
                if !content.ends_with('\n') {
                    println!();
                }
                println!("----");
            }
            _ => {}
        }
    }
}

impl EventHandler for ProgressHandler {
    fn handle_event(&mut self, graph: &TaskGraph, event: &DispatcherEvent) {
        match event {
            DispatcherEvent::DispatcherStart { num_workers } => {
                println!("Building with {num_workers} workers");
            }
            DispatcherEvent::DispatcherEnd { error: Some(e) } => {
                println!("Build failed: {e}");
            }
            DispatcherEvent::DispatcherEnd { error: None } => {
                println!("Build complete");
            }
            DispatcherEvent::TaskStart { task, .. } => {
                println!("START {task}");
            }
            DispatcherEvent::TaskComplete { task } => {
                let Some(state) = graph.task(task) else {
                    return;
                };
                let mut elapsed = format_elapsed(state.start_time, state.end_time);
                if !elapsed.is_empty() {
                    elapsed = format!(" ({elapsed})");
                }
                match &state.outcome {
                    Some(TaskOutcome::Skipped) => println!("SKIP  {task}"),
                    Some(TaskOutcome::Failed(msg)) => {
                        println!("FAIL  {task}{elapsed}: {msg}");
                        if !self.quiet {
                            self.echo_task_log(task);
                        }
                    }
                    _ => println!("OK    {task}{elapsed}"),
                }
            }
        }
    }
}

/// Print an error to stderr.
pub fn print_error(error: &dyn std::fmt::Display) {
    eprintln!("Error: {error}");
}

/// Format a Unix-nanosecond timestamp for humans; zero means "never".
#[must_use]
pub fn format_nanos(nanos: i64) -> String {
    if nanos == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_nanos(nanos)
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Format a pair of [`SystemTime`]s as a duration, when both are known.
#[must_use]
pub fn format_elapsed(start: Option<SystemTime>, end: Option<SystemTime>) -> String {
    match (start, end) {
        (Some(start), Some(end)) => end
            .duration_since(start)
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_default(),
        _ => String::new(),
    }
}
