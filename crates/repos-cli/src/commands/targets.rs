//! `repos targets [PATTERN...]`

use std::collections::BTreeMap;
use std::sync::Arc;

use repos_core::{resolve_targets, Repo, Target};
use repos_engine::{Error, Result};

pub fn execute(repo: &Repo, patterns: &[String]) -> Result<()> {
    let mut matched: BTreeMap<String, Arc<Target>> = BTreeMap::new();
    if patterns.is_empty() {
        for project in repo.projects() {
            for target in project.targets() {
                matched.insert(target.global_name(), Arc::clone(target));
            }
        }
    } else {
        for pattern in patterns {
            let targets = resolve_targets(repo, pattern).map_err(|e| match e {
                repos_core::Error::AmbiguousMatch { .. } => Error::configuration(format!(
                    "{pattern:?}: {e}"
                )),
                other => Error::from(other),
            })?;
            for target in targets {
                matched.insert(target.global_name(), target);
            }
        }
    }
    for (name, target) in matched {
        if target.description.is_empty() {
            println!("{name}");
        } else {
            println!("{name}\t{}", target.description);
        }
    }
    Ok(())
}
