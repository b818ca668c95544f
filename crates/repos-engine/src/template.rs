//! Tool parameter templating.
//!
//! Parameters are handlebars templates with four helpers:
//! - `{{env "NAME"}}` — process environment lookup
//! - `{{depout "DEP" ["KEY"]}}` — absolute path of a dependency output
//! - `{{depsrc "DEP"}}` — absolute source directory of a dependency
//! - `{{sh "CMDLINE"}}` — stdout of a shell command

use std::path::PathBuf;
use std::sync::Arc;

use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, RenderError,
    RenderErrorReason,
};
use repos_core::TargetName;

use crate::context::{shell_program, DepHandle, ExecContext};
use crate::{Error, Result};

/// Everything the helpers need, snapshotted from the execution context.
#[derive(Clone)]
pub(crate) struct HelperState {
    pub root_dir: PathBuf,
    pub out_base: PathBuf,
    pub project: String,
    pub source_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub deps: Arc<Vec<DepHandle>>,
}

impl HelperState {
    pub(crate) fn from_context(ctx: &ExecContext) -> Self {
        Self {
            root_dir: ctx.root_dir.clone(),
            out_base: ctx.out_base.clone(),
            project: ctx.target.name.project.clone(),
            source_dir: ctx.source_dir(),
            env: ctx.extra_env.clone(),
            deps: Arc::clone(&ctx.deps),
        }
    }

    /// Find a completed direct dependency; bare names are qualified with
    /// the current project.
    fn find_dep(&self, name: &str) -> std::result::Result<&DepHandle, RenderError> {
        let mut tn = TargetName::split(name);
        if tn.project.is_empty() {
            tn.project = self.project.clone();
        }
        self.deps
            .iter()
            .find(|d| d.direct && d.name == tn)
            .ok_or_else(|| {
                RenderErrorReason::Other(format!("invalid dependency {name:?}")).into()
            })
    }
}

/// Check that a template parses.
pub fn validate(template: &str) -> Result<()> {
    handlebars::template::Template::compile(template)
        .map(|_| ())
        .map_err(|e| Error::Template(e.to_string()))
}

/// Render a template with the task-bound helpers.
pub(crate) fn render(state: &HelperState, template: &str) -> Result<String> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    let state = Arc::new(state.clone());
    hb.register_helper("env", Box::new(EnvHelper));
    hb.register_helper(
        "depout",
        Box::new(DepOutHelper {
            state: Arc::clone(&state),
        }),
    );
    hb.register_helper(
        "depsrc",
        Box::new(DepSrcHelper {
            state: Arc::clone(&state),
        }),
    );
    hb.register_helper("sh", Box::new(ShHelper { state }));
    hb.render_template(template, &serde_json::Value::Null)
        .map_err(|e| Error::Template(e.to_string()))
}

fn param_str<'a>(
    h: &'a Helper<'_>,
    index: usize,
    helper: &'static str,
) -> std::result::Result<&'a str, RenderError> {
    h.param(index)
        .and_then(|v| v.value().as_str())
        .ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex(helper, index).into())
}

struct EnvHelper;

impl HelperDef for EnvHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let name = param_str(h, 0, "env")?;
        out.write(&std::env::var(name).unwrap_or_default())?;
        Ok(())
    }
}

struct DepOutHelper {
    state: Arc<HelperState>,
}

impl HelperDef for DepOutHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let dep_name = param_str(h, 0, "depout")?;
        let key = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");
        let dep = self.state.find_dep(dep_name)?;
        let outputs = dep.outputs.as_ref().ok_or_else(|| {
            RenderError::from(RenderErrorReason::Other(format!(
                "no outputs from {dep_name:?}"
            )))
        })?;
        let value = if key.is_empty() {
            if outputs.primary.is_empty() {
                return Err(RenderErrorReason::Other(format!(
                    "no primary output from {dep_name:?}"
                ))
                .into());
            }
            outputs.primary.as_str()
        } else {
            match outputs.extra.get(key) {
                Some(value) if !value.is_empty() => value.as_str(),
                _ => {
                    return Err(RenderErrorReason::Other(format!(
                        "no extra output {key:?} from {dep_name:?}"
                    ))
                    .into())
                }
            }
        };
        let path = dep.out_dir(&self.state.out_base).join(value);
        out.write(&path.display().to_string())?;
        Ok(())
    }
}

struct DepSrcHelper {
    state: Arc<HelperState>,
}

impl HelperDef for DepSrcHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let dep_name = param_str(h, 0, "depsrc")?;
        let dep = self.state.find_dep(dep_name)?;
        let path = dep.source_dir(&self.state.root_dir);
        out.write(&path.display().to_string())?;
        Ok(())
    }
}

struct ShHelper {
    state: Arc<HelperState>,
}

impl HelperDef for ShHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let command_line = param_str(h, 0, "sh")?;
        let output = std::process::Command::new(shell_program())
            .arg("-c")
            .arg(command_line)
            .current_dir(&self.state.source_dir)
            .envs(self.state.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .map_err(|e| {
                RenderError::from(RenderErrorReason::Other(format!(
                    "sh {command_line:?}: {e}"
                )))
            })?;
        if !output.status.success() {
            return Err(RenderErrorReason::Other(format!(
                "sh {command_line:?}: {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ))
            .into());
        }
        out.write(&String::from_utf8_lossy(&output.stdout))?;
        Ok(())
    }
}
