//! The `files` tool: declare source files without performing work.

use async_trait::async_trait;
use repos_core::Target;
use serde::Deserialize;

use crate::context::ExecContext;
use crate::registry::{Tool, ToolExecutor};
use crate::template;
use crate::{Error, ExecStatus, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct Params {
    /// Source declarations; trailing `/` walks the directory.
    srcs: Vec<String>,
    /// Additional opaque strings (templates).
    opaque: Vec<String>,
}

/// Factory for the `files` tool.
pub struct FilesTool;

impl Tool for FilesTool {
    fn create_executor(&self, target: &Target) -> Result<Box<dyn ToolExecutor>> {
        let params: Params = match &target.rule {
            Some(rule) => rule.params_as()?,
            None => Params::default(),
        };
        for (n, tpl) in params.opaque.iter().enumerate() {
            template::validate(tpl).map_err(|e| {
                Error::configuration(format!("invalid parameter opaque[{n}]: {e}"))
            })?;
        }
        Ok(Box::new(FilesExecutor { params }))
    }
}

struct FilesExecutor {
    params: Params,
}

#[async_trait]
impl ToolExecutor for FilesExecutor {
    async fn execute(&self, ctx: &mut ExecContext) -> Result<ExecStatus> {
        let mut cache = ctx.cache();
        for src in &self.params.srcs {
            if let Some(dir) = src.strip_suffix('/') {
                cache.add_source(dir, true)?;
            } else {
                cache.add_source(src, false)?;
            }
        }
        let opaques = ctx.render_all(&self.params.opaque)?;
        cache.add_opaque(opaques);

        if ctx.skippable && cache.verify() {
            return Ok(ExecStatus::Skipped);
        }
        cache.clear_saved()?;
        ctx.persist_cache_or_log(&mut cache);
        Ok(ExecStatus::Completed)
    }
}
