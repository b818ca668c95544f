//! Build engine for `repos`: task graph, dispatcher and tool executors.
//!
//! The flow: [`plan`] turns required target names into a prepared
//! [`TaskGraph`]; a [`Dispatcher`] executes it across a worker pool; each
//! task runs its target's tool through the [`ToolExecutor`] contract with
//! a per-task [`ExecContext`]; executors consult the incremental cache
//! and may return [`ExecStatus::Skipped`].

pub mod context;
pub mod dispatch;
mod error;
pub mod events;
pub mod graph;
pub mod protocol;
pub mod registry;
pub mod template;
pub mod tools;

pub use context::{DepHandle, ExecContext};
pub use dispatch::Dispatcher;
pub use error::{Error, ExecStatus, Result};
pub use events::{DispatcherEvent, EventHandler, NullEventHandler};
pub use graph::{plan, Task, TaskGraph, TaskOutcome, TaskState};
pub use registry::{Tool, ToolExecutor, ToolRegistry};
pub use tools::external::ExtTool;
