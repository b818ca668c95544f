//! `repos check` — plan the full graph to surface malformed targets and
//! cycles.

use repos_core::Repo;
use repos_engine::{plan, Result, ToolRegistry};

pub fn execute(repo: &Repo, registry: &ToolRegistry) -> Result<()> {
    let mut names = Vec::new();
    for project in repo.projects() {
        for target in project.targets() {
            names.push(target.global_name());
        }
    }
    plan(repo, registry, &names)?;
    Ok(())
}
