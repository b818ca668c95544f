//! Tool abstraction and the registry of built-in tools.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use repos_core::Target;

use crate::context::ExecContext;
use crate::{Error, ExecStatus, Result};

/// An executable instance of a tool, configured for one target.
///
/// Invoked once per task run. Returning [`ExecStatus::Skipped`] means the
/// task did no work because its cache was up-to-date; any error is the
/// task's failure.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, ctx: &mut ExecContext) -> Result<ExecStatus>;
}

/// A tool: a factory producing an executor from a target's parameters.
pub trait Tool: Send + Sync {
    fn create_executor(&self, target: &Target) -> Result<Box<dyn ToolExecutor>>;
}

/// Registry of built-in tools, owned by the caller and passed alongside
/// the repository handle. Dynamically registered external tools live in a
/// separate map owned by the dispatcher.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with all built-in tools (`exec`, `files`, `ext`).
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register("exec", Arc::new(crate::tools::exec::ExecTool))
            .expect("empty registry accepts exec");
        registry
            .register("files", Arc::new(crate::tools::files::FilesTool))
            .expect("empty registry accepts files");
        registry
            .register("ext", Arc::new(crate::tools::external::ExtProtocolTool))
            .expect("empty registry accepts ext");
        registry
    }

    /// Register a tool under a unique name.
    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Result<()> {
        let name = name.into();
        if self.tools.contains_key(&name) {
            return Err(Error::configuration(format!(
                "tool {name:?} already registered"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}
