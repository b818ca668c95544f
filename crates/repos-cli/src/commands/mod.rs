//! Command implementations.

pub mod build;
pub mod check;
pub mod log;
pub mod projects;
pub mod run;
pub mod status;
pub mod targets;

use std::sync::Arc;

use repos_core::{resolve_targets, Repo, Target};
use repos_engine::{Error, Result};

/// Resolve a pattern that must match exactly one target.
pub(crate) fn match_one_target(repo: &Repo, pattern: &str) -> Result<Arc<Target>> {
    let mut targets = resolve_targets(repo, pattern)?;
    match targets.len() {
        0 => Err(Error::configuration(format!(
            "no target matches {pattern:?}"
        ))),
        1 => Ok(targets.remove(0)),
        _ => Err(Error::configuration(format!(
            "more than one target matches {pattern:?}"
        ))),
    }
}
