//! Dispatcher events.
//!
//! Events are emitted from a single serialisation point (the coordinator),
//! so a handler observes task completions in the order the graph applied
//! them.

use crate::graph::TaskGraph;

/// Events emitted while the dispatcher runs.
#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    /// The run started with the given worker count.
    DispatcherStart { num_workers: usize },
    /// The run ended; `error` carries the terminal error message, if any.
    DispatcherEnd { error: Option<String> },
    /// A worker picked up a task.
    TaskStart { task: String, worker: usize },
    /// A task finished (success, skip or failure; inspect the graph).
    TaskComplete { task: String },
}

/// Receives dispatcher events together with the current graph state.
pub trait EventHandler: Send {
    fn handle_event(&mut self, graph: &TaskGraph, event: &DispatcherEvent);
}

/// A handler that discards all events.
pub struct NullEventHandler;

impl EventHandler for NullEventHandler {
    fn handle_event(&mut self, _graph: &TaskGraph, _event: &DispatcherEvent) {}
}
