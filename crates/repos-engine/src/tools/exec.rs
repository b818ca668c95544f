//! The `exec` tool: run a shell command or script with cache tracking.

use std::collections::BTreeMap;

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
    /// Shell command line (template). Mutually exclusive with
    /// `script-file`.
    command: String,
    /// Shell script relative to the source directory.
    script_file: String,
    /// Script arguments (templates); only valid with `script-file`.
    args: Vec<String>,
    /// Extra environment bindings `NAME=value` (templates).
    env: Vec<String>,
    /// Source declarations; trailing `/` walks the directory.
    srcs: Vec<String>,
    /// Primary output path.
    out: String,
    /// Keyed extra outputs.
    extra_out: BTreeMap<String, String>,
    /// Files generated into the source tree.
    generated: Vec<String>,
    /// Additional opaque strings (templates).
    opaque: Vec<String>,
}

/// Factory for the `exec` tool.
pub struct ExecTool;

impl Tool for ExecTool {
    fn create_executor(&self, target: &Target) -> Result<Box<dyn ToolExecutor>> {
        let rule = target
            .rule
            .as_ref()
            .ok_or_else(|| Error::configuration("exec tool requires parameters"))?;
        let params: Params = rule.params_as()?;
        if params.command.is_empty() && params.script_file.is_empty() {
            return Err(Error::configuration(
                "either command or script-file must be specified",
            ));
        }
        if !params.command.is_empty() && !params.script_file.is_empty() {
            return Err(Error::configuration(
                "either command or script-file must be specified, but not both",
            ));
        }
        if !params.command.is_empty() && !params.args.is_empty() {
            return Err(Error::configuration(
                "args can only be used with script-file, not command",
            ));
        }
        for (what, templates) in [
            ("command", std::slice::from_ref(&params.command)),
            ("args", params.args.as_slice()),
            ("env", params.env.as_slice()),
            ("opaque", params.opaque.as_slice()),
        ] {
            for (n, tpl) in templates.iter().enumerate() {
                template::validate(tpl).map_err(|e| {
                    Error::configuration(format!("invalid parameter {what}[{n}]: {e}"))
                })?;
            }
        }
        Ok(Box::new(ExecExecutor { params }))
    }
}

struct ExecExecutor {
    params: Params,
}

#[async_trait]
impl ToolExecutor for ExecExecutor {
    async fn execute(&self, ctx: &mut ExecContext) -> Result<ExecStatus> {
        let params = &self.params;
        let envs = ctx
            .render_envs(&params.env)
            .map_err(|e| Error::Template(format!("envs: {e}")))?;
        let args = ctx
            .render_all(&params.args)
            .map_err(|e| Error::Template(format!("args: {e}")))?;

        let mut cache = ctx.cache();
        if !params.script_file.is_empty() {
            cache.add_source(&params.script_file, false)?;
        }
        for src in &params.srcs {
            if let Some(dir) = src.strip_suffix('/') {
                cache.add_source(dir, true)?;
            } else {
                cache.add_source(src, false)?;
            }
        }
        if !params.out.is_empty() {
            cache.add_output("", &params.out);
        }
        for (key, path) in &params.extra_out {
            cache.add_output(key, path);
        }
        for generated in &params.generated {
            cache.add_generated(generated);
        }

        let command = if params.command.is_empty() {
            cache.add_opaque([params.script_file.clone()]);
            cache.add_opaque(args.iter().cloned());
            None
        } else {
            let command = ctx
                .render(&params.command)
                .map_err(|e| Error::Template(format!("rendering parameter command error: {e}")))?;
            cache.add_opaque([command.clone()]);
            Some(command)
        };
        cache.add_opaque(envs.iter().cloned());
        let opaques = ctx.render_all(&params.opaque)?;
        cache.add_opaque(opaques);

        if ctx.skippable && cache.verify() {
            let outputs = cache.saved_task_outputs().cloned().unwrap_or_default();
            ctx.publish_outputs(outputs);
            return Ok(ExecStatus::Skipped);
        }
        cache.clear_saved()?;

        let mut cmd = match &command {
            Some(command) => ctx.shell_command(command)?,
            None => ctx.shell_script(&params.script_file, &args)?,
        };
        ctx.add_bin_paths(&mut cmd);
        ctx.extend_env(&mut cmd, &envs);
        ctx.run_and_log(cmd).await?;

        ctx.persist_cache_or_log(&mut cache);
        ctx.publish_outputs(cache.task_outputs().clone());
        Ok(ExecStatus::Completed)
    }
}
