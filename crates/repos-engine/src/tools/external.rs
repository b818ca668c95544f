//! External tools speaking the control protocol.
//!
//! Two entry points share the protocol runner: the built-in `ext` tool
//! launches an arbitrary shell command line, and [`ExtTool`] wraps a
//! program registered dynamically by another task's `register-tool`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use repos_core::Target;
use serde::Deserialize;

use crate::context::ExecContext;
use crate::protocol::run_external;
use crate::registry::{Tool, ToolExecutor};
use crate::template;
use crate::{Error, ExecStatus, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct Params {
    /// Shell command line (template) of the external program.
    command: String,
    /// Extra environment bindings `NAME=value` (templates).
    env: Vec<String>,
}

/// Factory for the built-in `ext` tool.
pub struct ExtProtocolTool;

impl Tool for ExtProtocolTool {
    fn create_executor(&self, target: &Target) -> Result<Box<dyn ToolExecutor>> {
        let params: Params = match &target.rule {
            Some(rule) => rule.params_as()?,
            None => Params::default(),
        };
        if params.command.is_empty() {
            return Err(Error::configuration("missing parameter command"));
        }
        template::validate(&params.command)
            .map_err(|e| Error::configuration(format!("invalid parameter command: {e}")))?;
        for (n, tpl) in params.env.iter().enumerate() {
            template::validate(tpl).map_err(|e| {
                Error::configuration(format!("invalid parameter env[{n}]: {e}"))
            })?;
        }
        Ok(Box::new(ExtProtocolExecutor { params }))
    }
}

struct ExtProtocolExecutor {
    params: Params,
}

#[async_trait]
impl ToolExecutor for ExtProtocolExecutor {
    async fn execute(&self, ctx: &mut ExecContext) -> Result<ExecStatus> {
        let command = ctx
            .render(&self.params.command)
            .map_err(|e| Error::Template(format!("rendering parameter command error: {e}")))?;
        let envs = ctx
            .render_envs(&self.params.env)
            .map_err(|e| Error::Template(format!("envs: {e}")))?;
        let cmd = ctx.shell_command(&command)?;
        run_external(ctx, cmd, &envs).await
    }
}

/// A dynamically registered external tool: a program built by an earlier
/// target (or a source-relative script), with pre-rendered environment
/// and arguments.
#[derive(Debug, Clone)]
pub struct ExtTool {
    /// Global name of the task that registered the tool.
    pub task: String,
    pub executable: PathBuf,
    /// Launch through the shell instead of directly.
    pub shell_script: bool,
    /// Pre-rendered `NAME=value` bindings from the registration.
    pub envs: Vec<String>,
    /// Immediate command line arguments from the registration.
    pub args: Vec<String>,
}

impl ExtTool {
    /// Build an executor for a target whose rule names this tool. Each
    /// tool parameter becomes a `REPOS_TOOL_PARAM_<key>` environment
    /// template for the child.
    pub fn create_executor(&self, target: &Target) -> Result<Box<dyn ToolExecutor>> {
        let params: BTreeMap<String, serde_json::Value> = match &target.rule {
            Some(rule) if !rule.params.is_null() => rule.params_as()?,
            _ => BTreeMap::new(),
        };
        let mut env_templates = Vec::with_capacity(params.len());
        for (key, value) in params {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            let template = format!("REPOS_TOOL_PARAM_{key}={value}");
            template::validate(&template).map_err(|e| {
                Error::configuration(format!("invalid parameter {key}: {e}"))
            })?;
            env_templates.push(template);
        }
        Ok(Box::new(ExtToolExecutor {
            tool: self.clone(),
            env_templates,
        }))
    }
}

struct ExtToolExecutor {
    tool: ExtTool,
    env_templates: Vec<String>,
}

#[async_trait]
impl ToolExecutor for ExtToolExecutor {
    async fn execute(&self, ctx: &mut ExecContext) -> Result<ExecStatus> {
        let mut envs = self.tool.envs.clone();
        envs.extend(
            ctx.render_envs(&self.env_templates)
                .map_err(|e| Error::Template(format!("envs: {e}")))?,
        );
        let executable = self.tool.executable.display().to_string();
        let cmd = if self.tool.shell_script {
            ctx.shell_script(&executable, &self.tool.args)?
        } else {
            ctx.command(&executable, &self.tool.args)?
        };
        run_external(ctx, cmd, &envs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repos_core::{Rule, TargetName};

    fn target(rule: Option<Rule>) -> Target {
        Target {
            name: TargetName::split("p:t"),
            project_dir: PathBuf::from("p"),
            sub_dir: None,
            description: String::new(),
            deps: Vec::new(),
            always: false,
            launch: false,
            rule,
            register_tool: None,
        }
    }

    #[test]
    fn ext_tool_requires_command() {
        let t = target(Some(Rule {
            tool: "ext".into(),
            params: serde_json::json!({}),
        }));
        assert!(ExtProtocolTool.create_executor(&t).is_err());

        let t = target(Some(Rule {
            tool: "ext".into(),
            params: serde_json::json!({"command": "mytool --scan"}),
        }));
        assert!(ExtProtocolTool.create_executor(&t).is_ok());
    }

    #[test]
    fn dynamic_tool_parameters_become_env_templates() {
        let tool = ExtTool {
            task: "p:gen".into(),
            executable: PathBuf::from("/out/bin/gen"),
            shell_script: false,
            envs: vec![],
            args: vec![],
        };
        let t = target(Some(Rule {
            tool: "gen".into(),
            params: serde_json::json!({"mode": "fast", "level": 3}),
        }));
        assert!(tool.create_executor(&t).is_ok());

        // Null params (a bare rule entry) are accepted.
        let t = target(Some(Rule {
            tool: "gen".into(),
            params: serde_json::Value::Null,
        }));
        assert!(tool.create_executor(&t).is_ok());
    }
}
